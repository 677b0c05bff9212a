//! Buffer locking, ring rotation and storage-mode behavior against the software GPU.

use buffers_and_fences::buffer::{BufferDescriptor, BufferUsage, CreateError, Lifetime, LockMode};
use buffers_and_fences::imp::soft::{JournalEntry, SoftDevice};
use buffers_and_fences::imp::{ShaderStage, StorageMode};
use buffers_and_fences::{Config, Rhi, RingHazardPolicy};
use std::sync::Arc;

fn unified() -> (Arc<SoftDevice>, Rhi) {
    let device = SoftDevice::manual();
    let rhi = Rhi::new(device.clone(), Config::default()).unwrap();
    (device, rhi)
}

fn discrete() -> (Arc<SoftDevice>, Rhi) {
    let device = SoftDevice::builder().discrete().build();
    let rhi = Rhi::new(device.clone(), Config::default()).unwrap();
    (device, rhi)
}

/// Record one GPU use of `buffer`'s current slot and submit it without running the GPU.
fn use_once(rhi: &Rhi, buffer: &buffers_and_fences::buffer::Buffer) {
    let mut context = rhi.command_context("use");
    context.use_buffer(buffer);
    rhi.submit_command_lists(vec![context]);
}

#[test]
fn dynamic_buffer_write_then_read() {
    let (_device, rhi) = unified();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("constants", 256, BufferUsage::DYNAMIC), None)
        .unwrap();
    assert_eq!(buffer.lifetime(), Lifetime::Dynamic);
    assert_eq!(buffer.ring_len(), 3);
    assert_eq!(buffer.ring_index(), 0);
    {
        let mut lock = buffer.lock(LockMode::Write, 0, 0);
        assert_eq!(lock.len(), 256);
        lock.fill(7);
    }
    assert_eq!(buffer.ring_index(), 1);
    rhi.submit_command_lists(Vec::new());
    rhi.end_frame();
    assert!(buffer.read_to_vec().iter().all(|b| *b == 7));
}

#[test]
fn rotation_waits_for_in_flight_slot() {
    let (device, rhi) = unified();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("ring", 64, BufferUsage::DYNAMIC), None)
        .unwrap();
    for frame in 0..3u8 {
        buffer.fill(frame);
        use_once(&rhi, &buffer);
    }
    assert_eq!(device.pending_command_buffers(), 3);
    assert_eq!(buffer.hazards(), 0);
    //the fourth write lands back on the first slot that was written
    {
        let lock = buffer.lock(LockMode::Write, 0, 0);
        assert_eq!(buffer.ring_index(), 1);
        assert!(!buffer.slot_in_flight(1), "rotation reused a slot the GPU may still read");
        drop(lock);
    }
    assert_eq!(buffer.hazards(), 1);
}

#[test]
fn ring_write_read_and_wrap() {
    let (device, rhi) = unified();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("frame constants", 32, BufferUsage::DYNAMIC), None)
        .unwrap();
    assert_eq!(buffer.ring_len(), 3);
    let slot_bytes = |index: usize| {
        let backing = buffer.backing(index).unwrap();
        buffers_and_fences::imp::soft::gpu_contents(backing.as_ref()).unwrap()
    };

    buffer.fill(0xa);
    let slot_a = buffer.ring_index();
    use_once(&rhi, &buffer);
    buffer.fill(0xb);
    let slot_b = buffer.ring_index();
    use_once(&rhi, &buffer);
    assert_ne!(slot_a, slot_b);
    assert!(buffer.slot_in_flight(slot_a));
    assert!(buffer.slot_in_flight(slot_b));
    assert_eq!(buffer.read_to_vec(), vec![0xb; 32]);

    //the third write wraps onto slot 0, which no submitted work has touched
    assert!(!buffer.slot_in_flight(0));
    buffer.fill(0xc);
    assert_eq!(buffer.ring_index(), 0);
    assert_eq!(buffer.hazards(), 0);
    assert_eq!(slot_bytes(slot_a), vec![0xa; 32]);
    assert_eq!(slot_bytes(slot_b), vec![0xb; 32]);
    assert_eq!(buffer.read_to_vec(), vec![0xc; 32]);
    use_once(&rhi, &buffer);
    assert!(buffer.slot_in_flight(0));

    //once the GPU drains, the next lap reuses slots without a hazard
    device.run_until_idle();
    for index in 0..buffer.ring_len() {
        assert!(!buffer.slot_in_flight(index), "slot {index} still in flight after idle");
    }
    buffer.fill(0xd);
    assert_eq!(buffer.ring_index(), slot_a);
    assert_eq!(buffer.hazards(), 0);
    assert_eq!(slot_bytes(0), vec![0xc; 32]);
    assert_eq!(buffer.read_to_vec(), vec![0xd; 32]);
}

#[test]
fn warn_policy_counts_hazard_and_continues() {
    let device = SoftDevice::manual();
    let config = Config {
        ring_hazard: RingHazardPolicy::Warn,
        buffering_depth: 2,
        ..Config::default()
    };
    let rhi = Rhi::new(device.clone(), config).unwrap();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("warned", 16, BufferUsage::VOLATILE), None)
        .unwrap();
    buffer.fill(1);
    use_once(&rhi, &buffer);
    buffer.fill(2);
    use_once(&rhi, &buffer);
    buffer.fill(3);
    assert_eq!(buffer.hazards(), 1);
    assert!(buffer.slot_in_flight(buffer.ring_index()));
    device.run_until_idle();
    assert!(!buffer.slot_in_flight(buffer.ring_index()));
}

#[test]
fn partial_write_keeps_previous_contents() {
    let (_device, rhi) = unified();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("partial", 16, BufferUsage::DYNAMIC), None)
        .unwrap();
    buffer.fill(1);
    {
        let mut lock = buffer.lock(LockMode::Write, 4, 4);
        lock.copy_from_slice(&[9; 4]);
    }
    let contents = buffer.read_to_vec();
    assert_eq!(&contents[..4], &[1; 4]);
    assert_eq!(&contents[4..8], &[9; 4]);
    assert_eq!(&contents[8..], &[1; 8]);
}

#[test]
fn private_buffer_round_trips_through_transfers() {
    let (device, rhi) = discrete();
    let data: Vec<u8> = (0..64).collect();
    let buffer = rhi
        .create_buffer(
            &BufferDescriptor::new("vertices", 64, BufferUsage::STATIC | BufferUsage::VERTEX),
            Some(&data),
        )
        .unwrap();
    assert_eq!(buffer.storage_mode(), StorageMode::Private);
    assert_eq!(rhi.pending_uploads(), 1);
    assert_eq!(buffer.read_to_vec(), data);
    assert_eq!(rhi.pending_uploads(), 0);
    let backing = buffer.backing(0).unwrap();
    assert_eq!(
        buffers_and_fences::imp::soft::gpu_contents(backing.as_ref()).unwrap(),
        data
    );
    assert_eq!(device.pending_command_buffers(), 0);
}

#[test]
fn static_private_write_in_flight_orphans_backing() {
    let (device, rhi) = discrete();
    let buffer = rhi
        .create_buffer(
            &BufferDescriptor::new("static", 32, BufferUsage::STATIC | BufferUsage::INDEX),
            Some(&[1; 32]),
        )
        .unwrap();
    use_once(&rhi, &buffer);
    let before = buffer.backing(0).unwrap();
    assert!(buffer.slot_in_flight(0));
    {
        let mut lock = buffer.lock(LockMode::Write, 8, 8);
        lock.copy_from_slice(&[5; 8]);
    }
    let after = buffer.backing(0).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    let contents = buffer.read_to_vec();
    assert_eq!(&contents[..8], &[1; 8]);
    assert_eq!(&contents[8..16], &[5; 8]);
    assert_eq!(&contents[16..], &[1; 16]);
    device.run_until_idle();
}

#[test]
fn managed_buffer_reads_synchronize() {
    let (device, rhi) = discrete();
    let buffer = rhi
        .create_buffer(
            &BufferDescriptor::new(
                "readable",
                48,
                BufferUsage::DYNAMIC | BufferUsage::KEEP_CPU_ACCESSIBLE,
            ),
            None,
        )
        .unwrap();
    assert_eq!(buffer.storage_mode(), StorageMode::Managed);
    buffer.fill(3);
    //a GPU fill of part of the buffer must be visible to the next read
    let mut context = rhi.command_context("fill");
    context.fill_buffer(&buffer, 0..16, 8);
    rhi.submit_command_lists(vec![context]);
    let contents = buffer.read_to_vec();
    assert_eq!(&contents[..16], &[8; 16]);
    assert_eq!(&contents[16..], &[3; 32]);
    assert!(
        device
            .journal()
            .iter()
            .any(|e| matches!(e, JournalEntry::Synchronized { .. }))
    );
}

#[test]
fn inline_volatile_buffers_bind_as_bytes() {
    let device = SoftDevice::manual();
    let config = Config {
        inline_volatile_buffers: true,
        ..Config::default()
    };
    let rhi = Rhi::new(device.clone(), config).unwrap();
    let buffer = rhi
        .create_buffer(
            &BufferDescriptor::new("push", 64, BufferUsage::VOLATILE | BufferUsage::UNIFORM),
            None,
        )
        .unwrap();
    assert!(buffer.is_inline());
    assert_eq!(buffer.ring_len(), 0);
    buffer.fill(4);
    let mut context = rhi.command_context("compute");
    context.begin_compute_encoder();
    context.bind_buffer(ShaderStage::Compute, 3, &buffer);
    context.end_compute_encoder();
    rhi.submit_command_lists(vec![context]);
    device.run_until_idle();
    assert!(device.journal().iter().any(|e| matches!(
        e,
        JournalEntry::BytesBound {
            stage: ShaderStage::Compute,
            index: 3,
            len: 64,
            ..
        }
    )));
    assert!(buffer.read_to_vec().iter().all(|b| *b == 4));
}

#[test]
fn shader_resources_are_never_inline() {
    let device = SoftDevice::manual();
    let config = Config {
        inline_volatile_buffers: true,
        ..Config::default()
    };
    let rhi = Rhi::new(device, config).unwrap();
    let buffer = rhi
        .create_buffer(
            &BufferDescriptor::new(
                "srv",
                64,
                BufferUsage::VOLATILE | BufferUsage::SHADER_RESOURCE,
            ),
            None,
        )
        .unwrap();
    assert!(!buffer.is_inline());
    assert_eq!(buffer.ring_len(), 3);
}

#[test]
fn creation_errors() {
    let (_device, rhi) = unified();
    assert!(matches!(
        rhi.create_buffer(&BufferDescriptor::new("empty", 0, BufferUsage::DYNAMIC), None),
        Err(CreateError::ZeroSize { .. })
    ));
    assert!(matches!(
        rhi.create_buffer(
            &BufferDescriptor::new("short", 8, BufferUsage::STATIC),
            Some(&[0; 4])
        ),
        Err(CreateError::InitialDataSize { got: 4, size: 8, .. })
    ));
    let null = rhi
        .create_buffer(&BufferDescriptor::new("placeholder", 0, BufferUsage::NULL), None)
        .unwrap();
    assert_eq!(null.ring_len(), 0);
    assert_eq!(null.lifetime(), Lifetime::Null);
}

#[test]
fn out_of_memory_is_an_error() {
    let device = SoftDevice::builder().memory_budget(4 << 20).build();
    let rhi = Rhi::new(device, Config::default()).unwrap();
    assert!(matches!(
        rhi.create_buffer(&BufferDescriptor::new("huge", 8 << 20, BufferUsage::STATIC), None),
        Err(CreateError::Allocation(_))
    ));
}

#[test]
#[should_panic(expected = "cannot be locked")]
fn null_buffers_cannot_be_locked() {
    let (_device, rhi) = unified();
    let null = rhi
        .create_buffer(&BufferDescriptor::new("placeholder", 0, BufferUsage::NULL), None)
        .unwrap();
    let _lock = null.lock(LockMode::Write, 0, 0);
}

#[test]
#[should_panic(expected = "is already locked")]
fn locks_are_exclusive() {
    let (_device, rhi) = unified();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("exclusive", 16, BufferUsage::STATIC), None)
        .unwrap();
    let _first = buffer.lock(LockMode::Write, 0, 0);
    let _second = buffer.lock(LockMode::Write, 0, 0);
}

#[test]
#[should_panic(expected = "read locks are immutable")]
fn read_locks_are_immutable() {
    let (_device, rhi) = unified();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("ro", 16, BufferUsage::STATIC), None)
        .unwrap();
    let mut lock = buffer.lock(LockMode::Read, 0, 0);
    lock[0] = 1;
}

#[test]
#[should_panic(expected = "exceeds")]
fn lock_bounds_are_checked() {
    let (_device, rhi) = unified();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("small", 16, BufferUsage::STATIC), None)
        .unwrap();
    let _lock = buffer.lock(LockMode::Write, 8, 16);
}

#[test]
fn threaded_gpu_round_trip() {
    let device = SoftDevice::builder()
        .discrete()
        .threaded(std::time::Duration::from_millis(1))
        .build();
    let rhi = Rhi::new(device, Config::default()).unwrap();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("threaded", 128, BufferUsage::DYNAMIC), None)
        .unwrap();
    for frame in 0..5u8 {
        buffer.fill(frame);
        let mut context = rhi.command_context("frame");
        context.use_buffer(&buffer);
        let completion = rhi.submit_command_lists(vec![context]).unwrap();
        test_executors::spin_on(completion.completed());
        assert!(completion.is_signaled());
        rhi.end_frame();
        assert!(buffer.read_to_vec().iter().all(|b| *b == frame));
    }
    rhi.shutdown();
}
