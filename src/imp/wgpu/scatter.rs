// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use std::borrow::Cow;
use wgpu::util::DeviceExt;

const WORKGROUP_SIZE: u32 = 64;

const SOURCE: &str = r#"
struct Params {
    count: u32,
    words_per_entry: u32,
}

@group(0) @binding(0) var<storage, read> entries: array<u32>;
@group(0) @binding(1) var<storage, read> indices: array<u32>;
@group(0) @binding(2) var<storage, read_write> table: array<u32>;
@group(0) @binding(3) var<uniform> params: Params;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= params.count) {
        return;
    }
    let dst = indices[i];
    if ((dst + 1u) * params.words_per_entry > arrayLength(&table)) {
        return;
    }
    for (var w = 0u; w < params.words_per_entry; w = w + 1u) {
        table[dst * params.words_per_entry + w] = entries[i * params.words_per_entry + w];
    }
}
"#;

/// Compute pipeline that writes descriptor entries to their table indices.
#[derive(Debug)]
pub(super) struct ScatterPipeline {
    pipeline: wgpu::ComputePipeline,
}

impl ScatterPipeline {
    pub(super) fn new(device: &wgpu::Device) -> Self {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("descriptor scatter"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SOURCE)),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("descriptor scatter"),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });
        ScatterPipeline { pipeline }
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn encode(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        entries: &wgpu::Buffer,
        indices: &wgpu::Buffer,
        table: &wgpu::Buffer,
        count: u32,
        entry_size: u32,
    ) {
        assert_eq!(entry_size % 4, 0, "scatter entries must be whole words");
        let mut params = Vec::with_capacity(8);
        params.extend_from_slice(&count.to_le_bytes());
        params.extend_from_slice(&(entry_size / 4).to_le_bytes());
        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("descriptor scatter params"),
            contents: &params,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let layout = self.pipeline.get_bind_group_layout(0);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("descriptor scatter"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: entries.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: indices.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: table.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("descriptor scatter"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(count.div_ceil(WORKGROUP_SIZE), 1, 1);
    }
}
