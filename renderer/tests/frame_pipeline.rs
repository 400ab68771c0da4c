use std::collections::HashSet;

use renderer::acceleration_structure::{AccelerationStructureBuilder, AccelerationStructureLevel};
use renderer::camera::FixedCamera;
use renderer::commands::{Barrier, CommandList, GeometryInputs};
use renderer::config::RendererConfig;
use renderer::device::{BufferDesc, BufferUsage, MemoryLocation, RayTracingDevice};
use renderer::fence::{Fence, Ticket};
use renderer::frame_ring::FrameRing;
use renderer::headless::{GpuProgress, HeadlessDevice, PresentOrder};
use renderer::pipeline::exports;
use renderer::resource_state::{is_valid_edge, ResourceState, ResourceStateTracker};
use renderer::scene::SphereScene;
use renderer::shaders::ShaderLibrary;
use renderer::{FrameDriver, FrameState, RenderError};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 8;

fn config(buffer_count: u32) -> RendererConfig {
    RendererConfig {
        width: WIDTH,
        height: HEIGHT,
        buffer_count,
        ..RendererConfig::default()
    }
}

fn driver_on(device: HeadlessDevice, config: RendererConfig) -> FrameDriver<HeadlessDevice> {
    let shaders = ShaderLibrary::empty_modules(&exports::SHADERS);
    let camera = Box::new(FixedCamera::default_view(config.aspect_ratio()));
    FrameDriver::new(device, config, &SphereScene::default(), &shaders, camera).unwrap()
}

fn driver(progress: GpuProgress) -> FrameDriver<HeadlessDevice> {
    driver_on(HeadlessDevice::new(WIDTH, HEIGHT, 3, progress), config(3))
}

#[test]
fn four_spheres_share_one_bottom_level() {
    let mut driver = driver(GpuProgress::Immediate);

    {
        let device = driver.device().unwrap();
        let bindings = driver.bindings();
        let top = bindings.top_level().unwrap();
        let bottom = bindings.bottom_level().unwrap();

        assert_eq!(device.builds_executed(AccelerationStructureLevel::Bottom), 1);
        assert_eq!(device.builds_executed(AccelerationStructureLevel::Top), 1);
        assert_eq!(top.instance_count(), 4);
        assert!(device.top_level_is_valid(top.result()));

        let descriptors = device.instance_descriptors(top.instance_descriptors().unwrap());
        assert_eq!(descriptors.len(), 4);
        let ids: HashSet<u32> = descriptors.iter().map(|d| d.instance_id()).collect();
        assert_eq!(ids.len(), 4);
        assert!(descriptors
            .iter()
            .all(|d| d.bottom_level_address == bottom.address()));
        for (i, a) in descriptors.iter().enumerate() {
            for b in &descriptors[i + 1..] {
                assert_ne!(a.transform, b.transform);
            }
        }
    }

    driver.tick(0.016).unwrap();
    let device = driver.device().unwrap();
    assert_eq!(device.builds_executed(AccelerationStructureLevel::Bottom), 1);
    assert_eq!(device.builds_executed(AccelerationStructureLevel::Top), 1);
    assert_eq!(device.dispatches_executed(), 1);
}

#[test]
fn stalled_gpu_blocks_first_on_the_fourth_tick() {
    let mut driver = driver(GpuProgress::Stalled);
    let first_allocator = driver.ring().slot(0).allocator;

    for tick in 1..=3 {
        let stats = driver.tick(0.016).unwrap();
        assert!(!stats.blocked, "tick {} should not wait", tick);
    }
    assert_eq!(driver.fence().stats().blocking_waits, 0);
    let resets_before = driver.device().unwrap().allocator_resets(first_allocator);

    let stats = driver.tick(0.016).unwrap();
    assert!(stats.blocked);
    assert_eq!(stats.slot, 0);
    assert_eq!(driver.fence().stats().blocking_waits, 1);
    assert_eq!(
        driver.device().unwrap().allocator_resets(first_allocator),
        resets_before + 1
    );

    for _ in 5..=10 {
        assert!(driver.tick(0.016).unwrap().blocked);
    }
    assert_eq!(driver.fence().stats().blocking_waits, 7);
}

#[test]
fn tickets_strictly_increase() {
    let mut driver = driver(GpuProgress::Latency(1));
    let mut last = driver.fence().last_signaled();
    for _ in 0..12 {
        let stats = driver.tick(0.016).unwrap();
        assert!(stats.ticket > last);
        assert_eq!(stats.ticket, Ticket(last.value() + 1));
        last = stats.ticket;
    }
}

#[test]
fn allocators_reset_once_per_use() {
    let mut driver = driver(GpuProgress::Latency(2));
    for _ in 0..20 {
        driver.tick(0.016).unwrap();
    }
    let device = driver.device().unwrap();
    for slot in driver.ring().slots() {
        assert_eq!(device.allocator_resets(slot.allocator), slot.resets);
    }
    let total: u64 = driver.ring().slots().iter().map(|slot| slot.resets).sum();
    // Two setup submissions and one per tick.
    assert_eq!(total, 22);
}

#[test]
fn every_submitted_transition_is_an_allowed_edge() {
    let mut driver = driver(GpuProgress::Latency(1));
    for _ in 0..5 {
        driver.tick(0.016).unwrap();
    }
    let barriers = driver.device().unwrap().submitted_barriers();
    assert!(!barriers.is_empty());
    for barrier in barriers {
        if let Barrier::Transition { from, to, .. } = *barrier {
            assert!(is_valid_edge(from, to), "{:?} -> {:?}", from, to);
        }
    }
}

#[test]
fn shader_table_records_hold_the_pipeline_identifiers() {
    let driver = driver(GpuProgress::Immediate);
    let device = driver.device().unwrap();
    let table = driver.shader_table();
    let contents = device.buffer_contents(table.buffer()).unwrap();

    for (index, export) in [exports::RAY_GENERATION, exports::MISS, exports::HIT_GROUP]
        .into_iter()
        .enumerate()
    {
        let identifier = device.shader_identifier(driver.pipeline(), export).unwrap();
        assert_eq!(table.identifier(index), &identifier);
        let start = table.record_offset(index) as usize;
        assert_eq!(
            &contents[start..start + identifier.as_bytes().len()],
            identifier.as_bytes()
        );
    }

    let arguments = table.record_offset(2) as usize + 32;
    let materials = driver.bindings().materials_address(device).unwrap();
    assert_eq!(&contents[arguments..arguments + 8], &materials.to_le_bytes());
    assert_eq!(table.stride() % 64, 0);
}

#[test]
fn top_level_prebuild_sizes_are_stable() {
    let mut device = HeadlessDevice::new(WIDTH, HEIGHT, 2, GpuProgress::Immediate);
    let buffer = device
        .create_buffer(&BufferDesc {
            label: "instances",
            size: 4 * 64,
            location: MemoryLocation::Upload,
            usage: BufferUsage::InstanceDescriptors,
            initial_state: ResourceState::GenericRead,
        })
        .unwrap();
    let inputs = GeometryInputs::Instances { buffer, count: 4 };
    let first = device
        .acceleration_structure_prebuild_info(AccelerationStructureLevel::Top, &inputs)
        .unwrap();
    let second = device
        .acceleration_structure_prebuild_info(AccelerationStructureLevel::Top, &inputs)
        .unwrap();
    assert_eq!(first, second);
    assert!(first.result_size > 0);
}

#[test]
fn rebuilding_the_scene_gives_an_equal_sized_top_level() {
    let mut device = HeadlessDevice::new(WIDTH, HEIGHT, 2, GpuProgress::Immediate);
    let mut tracker = ResourceStateTracker::new();
    let mut fence = Fence::new();
    let ring = FrameRing::new(&mut device, &mut tracker).unwrap();
    let mut list = CommandList::new();
    let scene = SphereScene::default();

    let mut tops = Vec::new();
    for _ in 0..2 {
        let mut builder = AccelerationStructureBuilder::new();
        list.begin(ring.slot(0).allocator);
        let (_bottom, top) = builder
            .build_scene(&mut device, &mut tracker, &mut list, &scene)
            .unwrap();
        fence.submit(&mut device, &mut list).unwrap();
        fence.flush(&mut device).unwrap();
        builder.release_transients(&mut device, &mut tracker).unwrap();
        device.reset_command_allocator(ring.slot(0).allocator).unwrap();
        tops.push(top);
    }

    for top in &tops {
        assert!(device.top_level_is_valid(top.result()));
    }
    assert_eq!(tops[0].size(), tops[1].size());
    assert_ne!(tops[0].result(), tops[1].result());
}

#[test]
fn failed_recording_leaves_the_driver_ready_for_the_next_tick() {
    let mut driver = driver(GpuProgress::Immediate);
    driver.tick(0.016).unwrap();

    driver.device_mut().unwrap().fail_next_write("constants mapping lost");
    assert!(matches!(
        driver.tick(0.016),
        Err(RenderError::DeviceCall(_))
    ));
    assert_eq!(driver.state(), FrameState::Idle);
    assert_eq!(driver.frames(), 1);
    assert_eq!(
        driver.tracker().state(driver.bindings().output()),
        Some(ResourceState::CopySource)
    );

    driver.tick(0.016).unwrap();
    assert_eq!(driver.frames(), 2);
    assert_eq!(driver.device().unwrap().presented_frames().len(), 2);
}

#[test]
fn presents_follow_the_display_order() {
    let device = HeadlessDevice::new(WIDTH, HEIGHT, 3, GpuProgress::Latency(1))
        .with_present_order(PresentOrder::Sequence(vec![2, 0, 1]));
    let mut driver = driver_on(device, config(3));

    let slots: Vec<usize> = (0..6).map(|_| driver.tick(0.016).unwrap().slot).collect();
    assert_eq!(slots, vec![2, 0, 1, 2, 0, 1]);

    let presented: Vec<usize> = driver
        .device()
        .unwrap()
        .presented_frames()
        .iter()
        .map(|frame| frame.target_index)
        .collect();
    assert_eq!(presented, slots);
}

#[test]
fn presented_target_holds_the_traced_image() {
    let mut driver = driver(GpuProgress::Immediate);
    let stats = driver.tick(0.016).unwrap();
    let target = driver.ring().slot(stats.slot).target;
    let texels = driver.device().unwrap().texture_texels(target).unwrap();

    let (x, y) = (5usize, 3usize);
    let texel = &texels[(y * WIDTH as usize + x) * 4..][..4];
    assert_eq!(texel[0], x as u8);
    assert_eq!(texel[1], y as u8);
    assert_eq!(texel[3], 0xff);
}

#[test]
fn removed_device_fails_the_tick_after_submission() {
    let mut driver = driver(GpuProgress::Immediate);
    driver.tick(0.016).unwrap();
    driver
        .device_mut()
        .unwrap()
        .remove_device("driver reset");

    let result = driver.tick(0.016);
    assert!(matches!(result, Err(RenderError::DeviceRemoved { .. })));
    assert_eq!(driver.state(), FrameState::Submitted);
    assert_eq!(driver.frames(), 1);
}

#[test]
fn headless_device_follows_the_configured_ring_depth() {
    let config = RendererConfig::from_json(
        r#"{ "width": 16, "height": 8, "buffer_count": 4, "headless": { "progress": "stalled" } }"#,
    )
    .unwrap();
    let driver = driver_on(HeadlessDevice::from_config(&config), config);
    assert_eq!(driver.ring().len(), 4);
    assert_eq!(driver.state(), FrameState::Idle);
}
