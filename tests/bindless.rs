//! Descriptor heaps and the three publish strategies.

use buffers_and_fences::buffer::{BufferDescriptor, BufferUsage};
use buffers_and_fences::command::RenderPassDescriptor;
use buffers_and_fences::descriptor::{
    DescriptorEntry, DescriptorHandle, DescriptorKind, DescriptorUpdate, RESOURCE_HEAP_BIND_POINT,
    ResourceView, SAMPLER_HEAP_BIND_POINT,
};
use buffers_and_fences::imp::ShaderStage;
use buffers_and_fences::imp::soft::{JournalEntry, SoftDevice};
use buffers_and_fences::{Config, PublishStrategy, Rhi, SamplerDescriptor, TextureDescriptor};
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn rhi_with(strategy: PublishStrategy) -> (Arc<SoftDevice>, Rhi) {
    let device = SoftDevice::manual();
    let config = Config {
        publish_strategy: strategy,
        ..Config::default()
    };
    let rhi = Rhi::new(device.clone(), config).unwrap();
    (device, rhi)
}

fn texture_descriptor(label: &str) -> TextureDescriptor {
    TextureDescriptor {
        label: label.to_string(),
        width: 4,
        height: 4,
    }
}

/// Run one empty render pass so the context publishes dirty descriptors.
fn render_frame(rhi: &Rhi) {
    let mut context = rhi.command_context("frame");
    context.begin_render_pass(&RenderPassDescriptor::new("main"));
    context.end_render_pass();
    rhi.submit_command_lists(vec![context]);
}

#[test]
fn copy_publish_reaches_private_table() {
    let (_device, rhi) = rhi_with(PublishStrategy::Copy);
    let bindless = rhi.bindless();
    assert_eq!(bindless.strategy(), PublishStrategy::Copy);
    let texture = rhi.create_texture(&texture_descriptor("albedo")).unwrap();
    let buffer = rhi
        .create_buffer(
            &BufferDescriptor::new("lights", 256, BufferUsage::STATIC | BufferUsage::SHADER_RESOURCE),
            None,
        )
        .unwrap();
    let a = bindless.reserve(DescriptorKind::Standard);
    let _unused = bindless.reserve(DescriptorKind::Standard);
    let c = bindless.reserve(DescriptorKind::Standard);
    bindless.bind_texture(a, &texture, DescriptorUpdate::Immediate);
    bindless.bind_resource(
        c,
        ResourceView::Buffer {
            buffer: &buffer,
            offset: 16,
            len: 64,
        },
        DescriptorUpdate::Immediate,
    );
    let heap = bindless.heap(DescriptorKind::Standard);
    assert_eq!(heap.dirty_range(), Some(0..=2));

    render_frame(&rhi);
    assert!(!heap.is_dirty());
    assert_eq!(bindless.publishes(), 1);

    let entries = bindless.read_back(DescriptorKind::Standard).unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(
        entries[a.index() as usize],
        DescriptorEntry::texture(texture.native().as_ref(), 0.0)
    );
    let backing = buffer.backing(0).unwrap();
    assert_eq!(
        entries[c.index() as usize],
        DescriptorEntry::buffer(backing.as_ref(), 16, 64)
    );

    //nothing dirty, nothing published
    render_frame(&rhi);
    assert_eq!(bindless.publishes(), 1);
}

#[test]
fn compute_scatter_keeps_last_write_and_gates_render_pass() {
    let (device, rhi) = rhi_with(PublishStrategy::ComputeScatter);
    let bindless = rhi.bindless();
    assert_eq!(bindless.strategy(), PublishStrategy::ComputeScatter);
    let first = rhi.create_texture(&texture_descriptor("first")).unwrap();
    let second = rhi.create_texture(&texture_descriptor("second")).unwrap();
    let h0 = bindless.reserve(DescriptorKind::Standard);
    let h1 = bindless.reserve(DescriptorKind::Standard);
    bindless.bind_texture(h0, &first, DescriptorUpdate::Immediate);
    bindless.bind_texture(h1, &first, DescriptorUpdate::Immediate);
    bindless.bind_texture(h0, &second, DescriptorUpdate::Immediate);

    render_frame(&rhi);
    rhi.wait_for_gpu_idle();

    let journal = device.journal();
    let scattered: Vec<u32> = journal
        .iter()
        .filter_map(|e| match e {
            JournalEntry::Scattered { count, .. } => Some(*count),
            _ => None,
        })
        .collect();
    //h0 was written twice; only its last write is scattered
    assert_eq!(scattered, vec![2]);
    //the render pass waits on the event the scatter signaled
    let signaled = journal.iter().position(|e| matches!(e, JournalEntry::EventSignaled { .. }));
    let waited = journal.iter().position(|e| matches!(e, JournalEntry::EventWaited { .. }));
    let began_render = journal.iter().position(|e| {
        matches!(
            e,
            JournalEntry::EncoderBegan {
                kind: buffers_and_fences::imp::EncoderKind::Render,
                ..
            }
        )
    });
    assert!(signaled.is_some() && waited.is_some() && began_render.is_some());
    assert!(signaled < waited && waited < began_render);

    let entries = bindless.read_back(DescriptorKind::Standard).unwrap();
    assert_eq!(entries[h0.index() as usize], DescriptorEntry::texture(second.native().as_ref(), 0.0));
    assert_eq!(entries[h1.index() as usize], DescriptorEntry::texture(first.native().as_ref(), 0.0));
}

#[test]
fn compute_scatter_falls_back_without_compute() {
    let device = SoftDevice::builder()
        .capabilities(|c| c.supports_compute = false)
        .build();
    let config = Config {
        publish_strategy: PublishStrategy::ComputeScatter,
        ..Config::default()
    };
    let rhi = Rhi::new(device, config).unwrap();
    assert_eq!(rhi.bindless().strategy(), PublishStrategy::Copy);
}

#[test]
fn cpu_direct_writes_are_visible_at_once() {
    let (device, rhi) = rhi_with(PublishStrategy::CpuDirect);
    let bindless = rhi.bindless();
    let texture = rhi.create_texture(&texture_descriptor("direct")).unwrap();
    let handle = bindless.reserve(DescriptorKind::Standard);
    bindless.bind_texture(handle, &texture, DescriptorUpdate::Immediate);
    let entries = bindless.read_back(DescriptorKind::Standard).unwrap();
    assert_eq!(entries[0], DescriptorEntry::texture(texture.native().as_ref(), 0.0));
    assert_eq!(device.pending_command_buffers(), 0);
    render_frame(&rhi);
    assert_eq!(bindless.publishes(), 0);
}

#[test]
fn samplers_are_written_directly() {
    let (_device, rhi) = rhi_with(PublishStrategy::Copy);
    let bindless = rhi.bindless();
    let sampler = rhi
        .create_sampler(&SamplerDescriptor {
            label: "linear".to_string(),
            linear: true,
            repeat: false,
        })
        .unwrap();
    let handle = bindless.reserve(DescriptorKind::Sampler);
    bindless.bind_sampler(handle, &sampler, 0.5);
    let entries = bindless.read_back(DescriptorKind::Sampler).unwrap();
    assert_eq!(entries, vec![DescriptorEntry::sampler(sampler.native().as_ref(), 0.5)]);
}

#[test]
fn render_passes_bind_both_heaps() {
    let (device, rhi) = rhi_with(PublishStrategy::Copy);
    let bindless = rhi.bindless();
    let _resource = bindless.reserve(DescriptorKind::Standard);
    let _sampler = bindless.reserve(DescriptorKind::Sampler);
    render_frame(&rhi);
    device.run_until_idle();
    let bound: Vec<(ShaderStage, u32, u64)> = device
        .journal()
        .iter()
        .filter_map(|e| match e {
            JournalEntry::BufferBound { stage, index, len, .. } => Some((*stage, *index, *len)),
            _ => None,
        })
        .collect();
    for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
        assert!(bound.contains(&(stage, RESOURCE_HEAP_BIND_POINT, DescriptorEntry::SIZE)));
        assert!(bound.contains(&(stage, SAMPLER_HEAP_BIND_POINT, DescriptorEntry::SIZE)));
    }
}

#[test]
fn reserved_indices_are_unique_among_live_handles() {
    let device = SoftDevice::manual();
    let config = Config {
        resource_heap_size: 256 * DescriptorEntry::SIZE,
        debug_level: buffers_and_fences::DebugLevel::FastValidation,
        ..Config::default()
    };
    let rhi = Rhi::new(device, config).unwrap();
    let bindless = rhi.bindless();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<DescriptorHandle> = Vec::new();
    let mut indices = HashSet::new();
    for _ in 0..5_000 {
        if live.len() < 200 && (live.is_empty() || rng.gen_bool(0.55)) {
            let handle = bindless.reserve(DescriptorKind::Standard);
            assert!(handle.is_valid());
            assert!(indices.insert(handle.index()), "index {} handed out twice", handle.index());
            live.push(handle);
        } else {
            let handle = live.swap_remove(rng.gen_range(0..live.len()));
            indices.remove(&handle.index());
            bindless.free(handle);
        }
    }
    assert!(bindless.peak(DescriptorKind::Standard) <= 200);
}

#[test]
#[should_panic(expected = "descriptor heap exhausted")]
fn exhausting_the_heap_panics() {
    let device = SoftDevice::manual();
    let config = Config {
        resource_heap_size: 4 * DescriptorEntry::SIZE,
        ..Config::default()
    };
    let rhi = Rhi::new(device, config).unwrap();
    for _ in 0..4 {
        rhi.bindless().reserve(DescriptorKind::Standard);
    }
}

#[test]
fn try_reserve_reports_exhaustion() {
    let device = SoftDevice::manual();
    let config = Config {
        sampler_heap_size: 3 * DescriptorEntry::SIZE,
        ..Config::default()
    };
    let rhi = Rhi::new(device, config).unwrap();
    let bindless = rhi.bindless();
    assert!(bindless.try_reserve(DescriptorKind::Sampler).is_ok());
    assert!(bindless.try_reserve(DescriptorKind::Sampler).is_ok());
    assert!(matches!(
        bindless.try_reserve(DescriptorKind::Sampler),
        Err(buffers_and_fences::descriptor::Error::HeapExhausted {
            kind: DescriptorKind::Sampler,
            capacity: 3
        })
    ));
}

#[test]
fn deferred_free_and_update_wait_for_retirement() {
    let (device, rhi) = rhi_with(PublishStrategy::Copy);
    let bindless = rhi.bindless();
    let texture = rhi.create_texture(&texture_descriptor("late")).unwrap();
    let heap = bindless.heap(DescriptorKind::Standard).clone();
    let kept = bindless.reserve(DescriptorKind::Standard);
    let released = bindless.reserve(DescriptorKind::Standard);

    bindless.bind_texture(kept, &texture, DescriptorUpdate::Deferred);
    bindless.free_deferred(released);
    assert!(!heap.is_dirty());
    assert_eq!(heap.free_slots(), 0);

    render_frame(&rhi);
    device.run_until_idle();
    //records are only examined once they are older than frames_in_flight
    let mut destroyed = 0;
    for _ in 0..=rhi.config().frames_in_flight {
        destroyed += rhi.end_frame();
    }
    assert!(destroyed >= 2);
    assert_eq!(heap.free_slots(), 1);
    assert_eq!(heap.dirty_range(), Some(kept.index()..=kept.index()));
}

#[test]
fn deferred_update_stays_out_of_the_next_scatter() {
    let (device, rhi) = rhi_with(PublishStrategy::ComputeScatter);
    let bindless = rhi.bindless();
    assert_eq!(bindless.strategy(), PublishStrategy::ComputeScatter);
    let now = rhi.create_texture(&texture_descriptor("now")).unwrap();
    let later = rhi.create_texture(&texture_descriptor("later")).unwrap();
    let immediate = bindless.reserve(DescriptorKind::Standard);
    let deferred = bindless.reserve(DescriptorKind::Standard);
    let later_entry = DescriptorEntry::texture(later.native().as_ref(), 0.0);

    bindless.bind_texture(immediate, &now, DescriptorUpdate::Immediate);
    bindless.bind_texture(deferred, &later, DescriptorUpdate::Deferred);
    render_frame(&rhi);
    rhi.wait_for_gpu_idle();

    let scattered = |device: &SoftDevice| -> Vec<u32> {
        device
            .journal()
            .iter()
            .filter_map(|e| match e {
                JournalEntry::Scattered { count, .. } => Some(*count),
                _ => None,
            })
            .collect()
    };
    assert_eq!(scattered(&device), vec![1]);
    let entries = bindless.read_back(DescriptorKind::Standard).unwrap();
    assert_eq!(entries[immediate.index() as usize], DescriptorEntry::texture(now.native().as_ref(), 0.0));
    assert_ne!(entries[deferred.index() as usize], later_entry);

    //the write lands once the frame retires and rides the following publish
    for _ in 0..=rhi.config().frames_in_flight {
        rhi.end_frame();
    }
    assert!(bindless.heap(DescriptorKind::Standard).is_dirty());
    render_frame(&rhi);
    rhi.wait_for_gpu_idle();
    assert_eq!(scattered(&device), vec![1, 1]);
    let entries = bindless.read_back(DescriptorKind::Standard).unwrap();
    assert_eq!(entries[deferred.index() as usize], later_entry);
}

#[test]
fn deferred_free_waits_for_work_from_earlier_frames() {
    let (device, rhi) = rhi_with(PublishStrategy::Copy);
    let bindless = rhi.bindless();
    let heap = bindless.heap(DescriptorKind::Standard).clone();
    let handle = bindless.reserve(DescriptorKind::Standard);

    let mut context = rhi.command_context("frame 0");
    let frame_zero = context.command_buffer_fence();
    context.begin_render_pass(&RenderPassDescriptor::new("reads the heap"));
    context.end_render_pass();
    rhi.submit_command_lists(vec![context]);
    rhi.end_frame();

    //freed in a frame that commits nothing of its own
    bindless.free_deferred(handle);
    for _ in 0..4 {
        rhi.end_frame();
    }
    assert!(!frame_zero.is_signaled());
    assert_eq!(heap.free_slots(), 0);
    assert_ne!(bindless.reserve(DescriptorKind::Standard).index(), handle.index());

    device.run_until_idle();
    rhi.end_frame();
    assert!(frame_zero.is_signaled());
    assert_eq!(heap.free_slots(), 1);
}

/// Bind random textures to random slots, then check the publish carries every write.
fn random_updates_reach_the_table(strategy: PublishStrategy, seed: u64) {
    let (_device, rhi) = rhi_with(strategy);
    let bindless = rhi.bindless();
    assert_eq!(bindless.strategy(), strategy);
    let heap = bindless.heap(DescriptorKind::Standard).clone();
    let textures: Vec<_> = (0..8)
        .map(|i| rhi.create_texture(&texture_descriptor(&format!("random {i}"))).unwrap())
        .collect();
    let handles: Vec<_> = (0..64).map(|_| bindless.reserve(DescriptorKind::Standard)).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut expected = HashMap::new();
    for _ in 0..200 {
        let handle = handles[rng.gen_range(0..handles.len())];
        let texture = &textures[rng.gen_range(0..textures.len())];
        bindless.bind_texture(handle, texture, DescriptorUpdate::Immediate);
        expected.insert(handle.index(), DescriptorEntry::texture(texture.native().as_ref(), 0.0));
    }
    let dirty = heap.dirty_range().unwrap();
    for index in expected.keys() {
        assert!(dirty.contains(index), "index {index} written outside dirty range {dirty:?}");
    }

    render_frame(&rhi);
    rhi.wait_for_gpu_idle();
    assert!(!heap.is_dirty());
    let entries = bindless.read_back(DescriptorKind::Standard).unwrap();
    for (index, entry) in &expected {
        assert_eq!(entries[*index as usize], *entry, "slot {index}");
    }
}

#[test]
fn random_updates_publish_through_copy() {
    random_updates_reach_the_table(PublishStrategy::Copy, 0xc0b1);
}

#[test]
fn random_updates_publish_through_compute_scatter() {
    random_updates_reach_the_table(PublishStrategy::ComputeScatter, 0x5ca7);
}
