//! Performance benchmarks for the scanout core
//!
//! These cover the work done on every frame: damage accumulation and
//! merging, the software render pass, and the slot chain rotation on flip
//! completion.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use kms_compositor::output::{Output, OutputId};
use kms_compositor::renderer::damage::{Rect, Region};
use kms_compositor::renderer::software::{canvas_store, Canvas, SoftwareRenderer};
use kms_compositor::renderer::{render_output, RenderOptions, Renderer};
use kms_compositor::scanout::slots::{ScanoutSlotChain, Slot};
use kms_compositor::scanout::{
    BufferId, ConnectorId, CrtcId, FramebufferId, FramebufferLayout, ModeInfo, NativeSurface,
    ScanoutBuffer, DRM_FORMAT_XRGB8888,
};
use kms_compositor::surface::{BufferHandle, Surface, SurfaceId};
use kms_compositor::KmsConfig;

struct Bo(u64);

impl ScanoutBuffer for Bo {
    fn buffer_id(&self) -> BufferId {
        BufferId(self.0)
    }

    fn layout(&self) -> FramebufferLayout {
        FramebufferLayout {
            width: 1920,
            height: 1080,
            fourcc: DRM_FORMAT_XRGB8888,
            planes: Vec::new(),
            modifier: None,
        }
    }
}

fn scattered_rects(count: i32) -> Vec<Rect> {
    (0..count)
        .map(|i| Rect::new((i * 97) % 1800, (i * 53) % 1000, 64, 48))
        .collect()
}

/// Benchmark damage accumulation and merging
fn bench_damage(c: &mut Criterion) {
    let mut group = c.benchmark_group("damage");

    for count in [4, 32, 256] {
        let rects = scattered_rects(count);
        group.bench_function(format!("union_{}_rects", count), |b| {
            b.iter(|| {
                let mut region = Region::new();
                for rect in &rects {
                    region.union_rect(*rect);
                }
                black_box(region)
            });
        });

        let mut region = Region::new();
        for rect in &rects {
            region.union_rect(*rect);
        }
        group.bench_function(format!("merge_{}_rects", count), |b| {
            b.iter(|| black_box(region.merge_for_render(4)));
        });
    }

    group.finish();
}

/// Benchmark one software render pass over a full-HD output
fn bench_render_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_pass");
    group.sample_size(20);

    let store = canvas_store();
    store
        .borrow_mut()
        .insert(NativeSurface(1), Canvas::new(1920, 1080));
    let mut renderer = SoftwareRenderer::new(store.clone());

    let mut output = Output::new(
        OutputId::new(0).unwrap(),
        "DP-1",
        ConnectorId(1),
        CrtcId(1),
        ModeInfo::new(1920, 1080, 60_000, true),
        (0, 0),
        NativeSurface(1),
    );

    let surfaces: Vec<Surface> = (0..8)
        .map(|i| {
            let id = SurfaceId::new(i + 1);
            let mut surface = Surface::new(id, i as i32 * 200, i as i32 * 100, 400, 300);
            let buffer = BufferHandle(0x0040_80c0 + u64::from(i));
            surface.attach(buffer);
            surface.visible_on.insert(output.id());
            renderer.import_buffer(id, buffer).unwrap();
            surface
        })
        .collect();
    let options = RenderOptions::default();

    group.bench_function("small_damage", |b| {
        b.iter(|| {
            output.damage.clear();
            output.add_global_damage(Rect::new(300, 200, 64, 64));
            black_box(render_output(&mut renderer, &output, &surfaces, &options).unwrap())
        });
    });

    group.bench_function("full_damage", |b| {
        b.iter(|| {
            output.damage_all();
            black_box(render_output(&mut renderer, &output, &surfaces, &options).unwrap())
        });
    });

    group.finish();
}

/// Benchmark slot chain rotation on flip completion
fn bench_slot_rotation(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_chain");

    group.bench_function("submit_and_promote_1000_frames", |b| {
        b.iter_batched(
            ScanoutSlotChain::<Bo>::new,
            |mut chain| {
                let mut released = 0;
                for n in 0..1000u64 {
                    if chain
                        .set_pending(Slot::new(FramebufferId(n as u32), Bo(n)))
                        .is_err()
                    {
                        break;
                    }
                    if chain.promote().is_some() {
                        released += 1;
                    }
                }
                black_box(released)
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Benchmark configuration parsing
fn bench_config(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");

    let config = KmsConfig::default();
    let toml_str = toml::to_string(&config).unwrap();
    group.bench_function("toml_deserialization", |b| {
        b.iter(|| black_box(toml::from_str::<KmsConfig>(&toml_str).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_damage,
    bench_render_pass,
    bench_slot_rotation,
    bench_config
);
criterion_main!(benches);
