use std::fmt::Debug;

use petek::{atomic, atomic_read, read, thread_init, write, Scalar};

/// Keeps the backing storage word-aligned so the containing word of any
/// element stays inside the allocation.
#[repr(C, align(8))]
struct Aligned<T, const N: usize>([T; N]);

fn typed_read_only<T, const N: usize>(value_at: fn(usize) -> T)
where
    T: Scalar + PartialEq + Debug,
{
    thread_init();

    let storage: Aligned<T, N> = Aligned(core::array::from_fn(value_at));
    let base = storage.0.as_ptr();

    atomic_read(|| {
        for i in 0..N {
            assert_eq!(unsafe { read(base.add(i)) }?, value_at(i));
        }
        Ok(())
    })
    .unwrap();
}

fn typed_read_write<T, const N: usize>(value_at: fn(usize) -> T, doubled_at: fn(usize) -> T)
where
    T: Scalar + PartialEq + Debug,
{
    thread_init();

    let mut storage: Aligned<T, N> = Aligned(core::array::from_fn(value_at));
    let base = storage.0.as_mut_ptr();

    atomic(|| {
        for i in 0..N {
            assert_eq!(unsafe { read(base.add(i) as *const T) }?, value_at(i));
        }

        for i in (0..N).step_by(2) {
            unsafe { write(base.add(i), doubled_at(i)) }?;
        }

        for i in 0..N {
            let expected = if i % 2 == 0 { doubled_at(i) } else { value_at(i) };
            assert_eq!(unsafe { read(base.add(i) as *const T) }?, expected);
        }
        Ok(())
    })
    .unwrap();

    for i in 0..N {
        let expected = if i % 2 == 0 { doubled_at(i) } else { value_at(i) };
        assert_eq!(storage.0[i], expected);
    }

    atomic(|| {
        for i in (1..N).step_by(2) {
            unsafe { write(base.add(i), doubled_at(i)) }?;
        }

        for i in 0..N {
            assert_eq!(unsafe { read(base.add(i) as *const T) }?, doubled_at(i));
        }
        Ok(())
    })
    .unwrap();

    for i in 0..N {
        assert_eq!(storage.0[i], doubled_at(i));
    }
}

#[test]
fn test_u64_round_trip() {
    typed_read_only::<u64, 16>(|i| i as u64);
    typed_read_write::<u64, 16>(|i| i as u64, |i| (i * 2) as u64);
}

#[test]
fn test_i64_round_trip() {
    typed_read_only::<i64, 16>(|i| -(i as i64));
    typed_read_write::<i64, 16>(|i| -(i as i64), |i| -(i as i64) * 2);
}

#[test]
fn test_u32_round_trip() {
    typed_read_only::<u32, 32>(|i| i as u32);
    typed_read_write::<u32, 32>(|i| i as u32, |i| (i * 2) as u32);
}

#[test]
fn test_i32_round_trip() {
    typed_read_only::<i32, 32>(|i| -(i as i32));
    typed_read_write::<i32, 32>(|i| -(i as i32), |i| -(i as i32) * 2);
}

#[test]
fn test_u16_round_trip() {
    typed_read_only::<u16, 64>(|i| i as u16);
    typed_read_write::<u16, 64>(|i| i as u16, |i| (i * 2) as u16);
}

#[test]
fn test_i16_round_trip() {
    typed_read_only::<i16, 64>(|i| -(i as i16));
    typed_read_write::<i16, 64>(|i| -(i as i16), |i| -(i as i16) * 2);
}

#[test]
fn test_u8_round_trip() {
    typed_read_only::<u8, 128>(|i| i as u8);
    typed_read_write::<u8, 128>(|i| i as u8, |i| (i * 2) as u8);
}

#[test]
fn test_i8_round_trip() {
    typed_read_only::<i8, 128>(|i| i as i8 - 64);
    typed_read_write::<i8, 128>(|i| i as i8 - 64, |i| (i as i8 - 64).wrapping_mul(2));
}

#[test]
fn test_f32_round_trip() {
    typed_read_only::<f32, 32>(|i| i as f32 * 0.5);
    typed_read_write::<f32, 32>(|i| i as f32 * 0.5, |i| i as f32);
}

#[test]
fn test_f64_round_trip() {
    typed_read_only::<f64, 16>(|i| i as f64 * 0.25);
    typed_read_write::<f64, 16>(|i| i as f64 * 0.25, |i| i as f64);
}

#[test]
fn test_pointer_round_trip() {
    thread_init();

    let first = 1u32;
    let second = 2u32;

    #[repr(align(8))]
    struct Slot(*const u32);

    let mut slot = Slot(&first);
    let address = &mut slot.0 as *mut *const u32;

    atomic(|| {
        assert_eq!(unsafe { read(address as *const *const u32) }?, &first as *const u32);
        unsafe { write(address, &second as *const u32) }
    })
    .unwrap();

    assert_eq!(slot.0, &second as *const u32);
}

#[test]
fn test_mixed_width_writes_to_one_word() {
    thread_init();

    #[repr(align(8))]
    struct Block([u8; 8]);

    let mut block = Block([0; 8]);
    let base = block.0.as_mut_ptr();

    atomic(|| {
        unsafe { write(base.add(3), 0xAAu8) }?;
        unsafe { write(base, 0x11u8) }?;

        assert_eq!(unsafe { read(base.add(3) as *const u8) }?, 0xAA);
        assert_eq!(unsafe { read(base as *const u8) }?, 0x11);
        Ok(())
    })
    .unwrap();

    assert_eq!(block.0, [0x11, 0, 0, 0xAA, 0, 0, 0, 0]);
}
