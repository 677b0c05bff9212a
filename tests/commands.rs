//! Command contexts, the queue's commit policies and encoder ordering.

use buffers_and_fences::buffer::{BufferDescriptor, BufferUsage};
use buffers_and_fences::command::{CaptureHook, EncoderState, RenderPassDescriptor};
use buffers_and_fences::imp::EncoderKind;
use buffers_and_fences::imp::soft::{JournalEntry, SoftDevice};
use buffers_and_fences::{Config, DebugLevel, Rhi};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn manual(config: Config) -> (Arc<SoftDevice>, Rhi) {
    let device = SoftDevice::manual();
    let rhi = Rhi::new(device.clone(), config).unwrap();
    (device, rhi)
}

/// Every command buffer in the journal has at most one encoder open at a time.
fn assert_encoders_exclusive(journal: &[JournalEntry]) {
    let mut open: HashMap<u64, EncoderKind> = HashMap::new();
    for entry in journal {
        match entry {
            JournalEntry::EncoderBegan { command_buffer, kind } => {
                if let Some(previous) = open.insert(*command_buffer, *kind) {
                    panic!("{kind:?} began on {command_buffer} while {previous:?} was open");
                }
            }
            JournalEntry::EncoderEnded { command_buffer, kind, .. } => {
                assert_eq!(open.remove(command_buffer), Some(*kind));
            }
            _ => {}
        }
    }
    assert!(open.is_empty(), "encoders left open: {open:?}");
}

#[test]
fn encoders_switch_without_overlap() {
    let (device, rhi) = manual(Config::default());
    let a = rhi
        .create_buffer(&BufferDescriptor::new("a", 64, BufferUsage::STATIC), Some(&[1; 64]))
        .unwrap();
    let b = rhi
        .create_buffer(&BufferDescriptor::new("b", 64, BufferUsage::STATIC), None)
        .unwrap();
    let mut context = rhi.command_context("mixed");
    context.copy_buffer_to_buffer(&a, 0, &b, 0, 32);
    assert_eq!(context.encoder_state(), EncoderState::Blit);
    context.begin_compute_encoder();
    assert_eq!(context.encoder_state(), EncoderState::Compute);
    context.fill_buffer(&b, 32..64, 2);
    assert_eq!(context.encoder_state(), EncoderState::Blit);
    context.begin_render_pass(&RenderPassDescriptor::new("draw"));
    assert!(context.within_render_pass());
    context.end_render_pass();
    context.begin_blit_encoder();
    context.end_blit_encoder();
    assert_eq!(context.encoder_state(), EncoderState::Idle);
    rhi.submit_command_lists(vec![context]);
    device.run_until_idle();

    let journal = device.journal();
    assert_encoders_exclusive(&journal);
    //every encoder after the first waits on its predecessor's fence
    let ended: Vec<_> = journal
        .iter()
        .filter_map(|e| match e {
            JournalEntry::EncoderEnded { fence: Some(fence), .. } => Some(*fence),
            _ => None,
        })
        .collect();
    let waited: Vec<_> = journal
        .iter()
        .filter_map(|e| match e {
            JournalEntry::EncoderFenceWaited { fence, .. } => Some(*fence),
            _ => None,
        })
        .collect();
    assert_eq!(ended.len(), 5);
    assert_eq!(&waited[..], &ended[..4]);
    assert_eq!(b.read_to_vec()[..32], [1; 32]);
    assert_eq!(b.read_to_vec()[32..], [2; 32]);
}

#[test]
#[should_panic(expected = "inside a render pass")]
fn compute_inside_render_pass_panics() {
    let (_device, rhi) = manual(Config::default());
    let mut context = rhi.command_context("bad");
    context.begin_render_pass(&RenderPassDescriptor::new("pass"));
    context.begin_compute_encoder();
}

#[test]
#[should_panic(expected = "fence operations are not allowed inside a render pass")]
fn fences_inside_render_pass_panic() {
    let (_device, rhi) = manual(Config::default());
    let fence = rhi.create_fence("cross").unwrap();
    let mut context = rhi.command_context("bad");
    context.begin_render_pass(&RenderPassDescriptor::new("pass"));
    context.signal_fence(&fence.next_value());
}

#[test]
fn completion_runs_after_gpu() {
    let (device, rhi) = manual(Config::default());
    let done = Arc::new(AtomicBool::new(false));
    let mut context = rhi.command_context("work");
    let fence = context.command_buffer_fence();
    let flag = done.clone();
    context.add_completion_handler(move || flag.store(true, Ordering::SeqCst));
    let completion = rhi.submit_command_lists(vec![context]).unwrap();
    assert_eq!(completion.value(), fence.value());
    assert!(!fence.is_signaled());
    assert!(!done.load(Ordering::SeqCst));
    device.run_until_idle();
    assert!(fence.is_signaled());
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn gpu_wait_stalls_until_signaled() {
    let (device, rhi) = manual(Config::default());
    let fence = rhi.create_fence("handoff").unwrap();
    let point = fence.next_value();
    let mut consumer = rhi.command_context("consumer");
    consumer.wait_for_fence(&point);
    let consumer_done = consumer.command_buffer_fence();
    rhi.submit_command_lists(vec![consumer]);
    device.run_until_idle();
    assert!(!consumer_done.is_signaled());
    assert_eq!(device.pending_command_buffers(), 1);

    point.signal();
    device.run_until_idle();
    assert!(consumer_done.is_signaled());
    assert_eq!(device.pending_command_buffers(), 0);
}

#[test]
fn recycled_fence_ignores_signals_queued_for_its_previous_owner() {
    let (device, rhi) = manual(Config::default());
    let old = rhi.create_fence("old").unwrap();
    let point = old.next_value();
    let mut context = rhi.command_context("signaler");
    context.signal_fence(&point);
    rhi.submit_command_lists(vec![context]);
    let created = rhi.queue().fence_pool().events_created();
    drop(point);
    drop(old);

    let recycled = rhi.create_fence("recycled").unwrap();
    assert_eq!(rhi.queue().fence_pool().events_created(), created);
    let fresh = recycled.next_value();
    device.run_until_idle();
    assert!(!fresh.is_signaled(), "a stale GPU signal satisfied a new fence");
    fresh.signal();
    assert!(fresh.is_signaled());
}

#[test]
fn wait_for_complete_blocks_on_commit() {
    let (device, rhi) = manual(Config {
        debug_level: DebugLevel::WaitForComplete,
        ..Config::default()
    });
    let mut context = rhi.command_context("blocking");
    context.command_buffer_fence();
    let completion = rhi.submit_command_lists(vec![context]).unwrap();
    assert!(completion.is_signaled());
    assert_eq!(device.pending_command_buffers(), 0);
}

#[test]
fn conditional_submit_commits_on_encoder_end() {
    let (_device, rhi) = manual(Config {
        debug_level: DebugLevel::ConditionalSubmit,
        ..Config::default()
    });
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("target", 16, BufferUsage::STATIC), None)
        .unwrap();
    let mut context = rhi.command_context("eager");
    context.fill_buffer(&buffer, 0..16, 1);
    context.end_blit_encoder();
    assert_eq!(rhi.queue().committed(), 1);
    context.fill_buffer(&buffer, 0..8, 2);
    context.end_blit_encoder();
    assert_eq!(rhi.queue().committed(), 2);
    let last = rhi.submit_command_lists(vec![context]).unwrap();
    assert_eq!(rhi.queue().committed(), 2);
    last.wait();
    assert_eq!(buffer.read_to_vec()[..8], [2; 8]);
}

#[test]
#[should_panic(expected = "command buffer allocation failed")]
fn command_buffer_allocation_failure_is_fatal() {
    let (device, rhi) = manual(Config::default());
    device.set_fail_command_buffers(true);
    let mut context = rhi.command_context("doomed");
    context.command_buffer_fence();
}

#[test]
fn command_buffer_allocation_failure_is_reported() {
    let (device, rhi) = manual(Config::default());
    device.set_fail_command_buffers(true);
    assert!(rhi.queue().create_command_buffer("direct").is_err());
    device.set_fail_command_buffers(false);
    let mut command_buffer = rhi.queue().create_command_buffer("direct").unwrap();
    assert!(!command_buffer.has_completion_fence());
    let completion = command_buffer.completion_fence();
    assert!(command_buffer.has_completion_fence());
    let committed = rhi.queue().commit(command_buffer);
    assert_eq!(committed.value(), completion.value());
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl CaptureHook for Recorder {
    fn begin_capture(&self, command_buffers: u32) {
        self.events.lock().unwrap().push(format!("begin {command_buffers}"));
    }

    fn on_commit(&self, label: &str, index: u64) {
        self.events.lock().unwrap().push(format!("commit {label} {index}"));
    }

    fn end_capture(&self) {
        self.events.lock().unwrap().push("end".to_string());
    }
}

#[test]
fn capture_hook_sees_commits() {
    let (_device, rhi) = manual(Config::default());
    let recorder = Arc::new(Recorder::default());
    rhi.queue().set_capture_hook(Some(recorder.clone() as Arc<dyn CaptureHook>));
    rhi.queue().capture_next(2);
    let contexts = ["a", "b", "c"]
        .into_iter()
        .map(|label| {
            let mut context = rhi.command_context(label);
            context.command_buffer_fence();
            context
        })
        .collect();
    rhi.submit_command_lists(contexts);
    rhi.queue().set_capture_hook(None);
    assert_eq!(
        *recorder.events.lock().unwrap(),
        vec![
            "begin 2".to_string(),
            "commit a #0 0".to_string(),
            "commit b #0 1".to_string(),
            "end".to_string(),
            "commit c #0 2".to_string(),
        ]
    );
}

#[test]
fn submission_thread_defers_bookkeeping() {
    let (_device, rhi) = manual(Config {
        submission_thread: true,
        frames_in_flight: 0,
        ..Config::default()
    });
    let mut context = rhi.command_context("threaded");
    let completion = context.command_buffer_fence();
    rhi.submit_command_lists(vec![context]);
    rhi.wait_for_gpu_idle();
    assert!(completion.is_signaled());
    //the committed command buffer record is the only deferred object
    assert_eq!(rhi.end_frame(), 1);
    assert_eq!(rhi.deletion_queue().pending(), 0);
}

#[test]
fn dropped_buffer_outlives_gpu_use() {
    let (device, rhi) = manual(Config::default());
    let live_before = device.live_buffers();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("scratch", 64, BufferUsage::STATIC), None)
        .unwrap();
    assert_eq!(device.live_buffers(), live_before + 1);
    let mut context = rhi.command_context("reader");
    context.use_buffer(&buffer);
    rhi.submit_command_lists(vec![context]);
    drop(buffer);
    for _ in 0..4 {
        rhi.end_frame();
    }
    //the GPU has not run, so the backing must survive
    assert_eq!(device.live_buffers(), live_before + 1);
    device.run_until_idle();
    rhi.end_frame();
    assert_eq!(device.live_buffers(), live_before);

    let journal = device.journal();
    let completed = journal
        .iter()
        .position(|e| matches!(e, JournalEntry::Completed { .. }))
        .unwrap();
    let freed = journal
        .iter()
        .position(|e| matches!(e, JournalEntry::BufferFreed { label, .. } if label == "scratch"))
        .unwrap();
    assert!(completed < freed);
}

#[test]
fn uploads_precede_later_work() {
    let device = SoftDevice::builder().discrete().build();
    let rhi = Rhi::new(device.clone(), Config::default()).unwrap();
    let data: Vec<u8> = (0..64).map(|i| i * 3).collect();
    let source = rhi
        .create_buffer(&BufferDescriptor::new("source", 64, BufferUsage::STATIC), Some(&data))
        .unwrap();
    let destination = rhi
        .create_buffer(&BufferDescriptor::new("destination", 64, BufferUsage::STATIC), None)
        .unwrap();
    let mut context = rhi.command_context("copy");
    context.copy_buffer_to_buffer(&source, 0, &destination, 0, 64);
    rhi.submit_command_lists(vec![context]);
    rhi.wait_for_gpu_idle();
    assert_eq!(destination.read_to_vec(), data);
}

#[test]
fn context_submit_runs_staged_uploads_first() {
    let device = SoftDevice::builder().discrete().build();
    let rhi = Rhi::new(device.clone(), Config::default()).unwrap();
    let data: Vec<u8> = (1..=64).collect();
    let source = rhi
        .create_buffer(&BufferDescriptor::new("source", 64, BufferUsage::STATIC), Some(&data))
        .unwrap();
    let destination = rhi
        .create_buffer(&BufferDescriptor::new("destination", 64, BufferUsage::STATIC), None)
        .unwrap();
    assert_eq!(rhi.pending_uploads(), 1);
    let mut context = rhi.command_context("direct copy");
    context.copy_buffer_to_buffer(&source, 0, &destination, 0, 64);
    context.submit();
    assert_eq!(rhi.pending_uploads(), 0);
    device.run_until_idle();
    let backing = destination.backing(0).unwrap();
    assert_eq!(
        buffers_and_fences::imp::soft::gpu_contents(backing.as_ref()).unwrap(),
        data
    );
}

#[test]
fn shutdown_destroys_everything() {
    let device = SoftDevice::manual();
    let rhi = Rhi::new(device.clone(), Config::default()).unwrap();
    let buffer = rhi
        .create_buffer(&BufferDescriptor::new("late", 32, BufferUsage::DYNAMIC), None)
        .unwrap();
    let mut context = rhi.command_context("last");
    context.use_buffer(&buffer);
    rhi.submit_command_lists(vec![context]);
    drop(buffer);
    rhi.shutdown();
    assert_eq!(device.live_buffers(), 0);
}
