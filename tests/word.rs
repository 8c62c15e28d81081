use petek::{atomic, atomic_read, read_word, thread_init, write_word, TransactionError, Word};

#[test]
fn test_word_read_only() {
    thread_init();

    let words: [Word; 16] = core::array::from_fn(|i| i as Word);
    let base = words.as_ptr();

    atomic_read(|| {
        for i in 0..16 {
            assert_eq!(unsafe { read_word(base.add(i)) }?, i as Word);
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_word_read_write() {
    thread_init();

    let mut words: [Word; 16] = core::array::from_fn(|i| i as Word);
    let base = words.as_mut_ptr();

    atomic(|| {
        for i in 0..16 {
            assert_eq!(unsafe { read_word(base.add(i)) }?, i as Word);
        }

        for i in (0..16).step_by(2) {
            unsafe { write_word(base.add(i), (i * 2) as Word, Word::MAX) }?;
        }

        // Buffered writes are visible to our own reads before commit.
        for i in 0..16 {
            let expected = if i % 2 == 0 { i * 2 } else { i } as Word;
            assert_eq!(unsafe { read_word(base.add(i)) }?, expected);
        }
        Ok(())
    })
    .unwrap();

    for (i, &word) in words.iter().enumerate() {
        let expected = if i % 2 == 0 { i * 2 } else { i } as Word;
        assert_eq!(word, expected);
    }

    // Second transaction completes the doubling.
    atomic(|| {
        for i in (1..16).step_by(2) {
            unsafe { write_word(base.add(i), (i * 2) as Word, Word::MAX) }?;
        }

        for i in 0..16 {
            assert_eq!(unsafe { read_word(base.add(i)) }?, (i * 2) as Word);
        }
        Ok(())
    })
    .unwrap();

    for (i, &word) in words.iter().enumerate() {
        assert_eq!(word, (i * 2) as Word);
    }
}

#[test]
fn test_partial_word_masking() {
    thread_init();

    let mut word: Word = 0x1122_3344_5566_7788;
    let ptr = &mut word as *mut Word;

    atomic(|| {
        unsafe { write_word(ptr, 0xAA << 24, 0xFF << 24) }?;

        // Read-your-own-writes is bit-exact, including unmasked bits.
        assert_eq!(unsafe { read_word(ptr) }?, 0x1122_3344_AA66_7788);
        Ok(())
    })
    .unwrap();

    assert_eq!(word, 0x1122_3344_AA66_7788);
}

#[test]
fn test_masked_writes_merge() {
    thread_init();

    let mut word: Word = 0;
    let ptr = &mut word as *mut Word;

    atomic(|| {
        unsafe { write_word(ptr, 0x11, 0xFF) }?;
        unsafe { write_word(ptr, 0x2200, 0xFF00) }?;
        // Overlapping write: later bits override within the overlap.
        unsafe { write_word(ptr, 0x33, 0xFF) }?;

        assert_eq!(unsafe { read_word(ptr) }?, 0x2233);
        Ok(())
    })
    .unwrap();

    assert_eq!(word, 0x2233);
}

#[test]
fn test_last_write_wins() {
    thread_init();

    let mut word: Word = 0;
    let ptr = &mut word as *mut Word;

    atomic(|| {
        unsafe { write_word(ptr, 41, Word::MAX) }?;
        unsafe { write_word(ptr, 42, Word::MAX) }?;
        assert_eq!(unsafe { read_word(ptr) }?, 42);
        Ok(())
    })
    .unwrap();

    assert_eq!(word, 42);
}

#[test]
fn test_nested_atomic_flattens() {
    thread_init();

    let mut word: Word = 0;
    let ptr = &mut word as *mut Word;

    let value = atomic(|| {
        atomic(|| unsafe { write_word(ptr, 1, Word::MAX) })?;
        unsafe { read_word(ptr) }
    })
    .unwrap();

    assert_eq!(value, 1);
    assert_eq!(word, 1);
}

#[test]
fn test_nested_read_only_flattens() {
    thread_init();

    let mut word: Word = 5;
    let ptr = &mut word as *mut Word;

    let value = atomic(|| {
        unsafe { write_word(ptr, 6, Word::MAX) }?;
        // A read-only block inside a read-write transaction joins it and
        // sees its buffered writes.
        atomic_read(|| unsafe { read_word(ptr) })
    })
    .unwrap();

    assert_eq!(value, 6);
    assert_eq!(word, 6);
}

#[test]
fn test_read_write_inside_read_only_rejected() {
    thread_init();

    let mut word: Word = 7;
    let ptr = &mut word as *mut Word;

    let observed = atomic_read(|| {
        let value = unsafe { read_word(ptr) }?;

        match atomic(|| unsafe { write_word(ptr, 9, Word::MAX) }) {
            Err(TransactionError::IncompatibleNesting) => {}
            other => panic!("expected nesting rejection, got {:?}", other),
        }

        Ok(value)
    })
    .unwrap();

    assert_eq!(observed, 7);
    assert_eq!(word, 7);
}

#[test]
fn test_uninitialized_thread_rejected() {
    std::thread::spawn(|| {
        let result = atomic(|| Ok(()));
        assert_eq!(result, Err(TransactionError::Uninitialized));
    })
    .join()
    .unwrap();
}

#[test]
fn test_user_error_terminates_transaction() {
    thread_init();

    let mut word: Word = 1;
    let ptr = &mut word as *mut Word;

    let result: Result<(), TransactionError> = atomic(|| {
        unsafe { write_word(ptr, 2, Word::MAX) }?;
        Err(TransactionError::User("application bailed".into()))
    });
    assert!(matches!(result, Err(TransactionError::User(_))));

    // The aborted write never published and the engine is reusable.
    assert_eq!(word, 1);
    atomic(|| unsafe { write_word(ptr, 3, Word::MAX) }).unwrap();
    assert_eq!(word, 3);
}

#[test]
fn test_panic_in_closure_releases_engine() {
    thread_init();

    let mut word: Word = 0;
    let ptr = &mut word as *mut Word;
    let ptr_bits = ptr as usize;

    let panicked = std::panic::catch_unwind(move || {
        let _: Result<(), TransactionError> = atomic(|| {
            unsafe { write_word(ptr_bits as *mut Word, 1, Word::MAX) }?;
            panic!("mid-transaction failure");
        });
    });
    assert!(panicked.is_err());

    // The stripe lock was released on unwind; new transactions proceed.
    atomic(|| unsafe { write_word(ptr, 4, Word::MAX) }).unwrap();
    assert_eq!(word, 4);
}
