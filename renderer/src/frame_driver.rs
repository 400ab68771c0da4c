//! Drives one frame per tick: acquire a slot, record, submit, present.

use crate::acceleration_structure::AccelerationStructureBuilder;
use crate::bindings::{GlobalBindings, RayTracingConstants};
use crate::camera::CameraSource;
use crate::commands::{Command, CommandList};
use crate::config::RendererConfig;
use crate::device::{BindingSetHandle, PipelineHandle, RayTracingDevice};
use crate::error::{DeviceCallError, RenderError, Result};
use crate::fence::{Fence, Ticket, WaitOutcome};
use crate::frame_ring::FrameRing;
use crate::pipeline::{exports, ray_tracing_pipeline};
use crate::resource_state::{ResourceState, ResourceStateTracker};
use crate::scene::SphereScene;
use crate::shader_table::{ShaderTable, ShaderTableRecords};
use crate::shaders::ShaderLibrary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Recording,
    Submitted,
    Presented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames completed so far, this one included.
    pub frame: u64,
    pub slot: usize,
    pub ticket: Ticket,
    /// Whether acquiring the slot had to wait for the GPU.
    pub blocked: bool,
}

pub struct FrameDriver<D: RayTracingDevice> {
    // Taken by `shutdown`.
    device: Option<D>,
    config: RendererConfig,
    camera: Box<dyn CameraSource>,
    tracker: ResourceStateTracker,
    fence: Fence,
    ring: FrameRing,
    list: CommandList,
    bindings: GlobalBindings,
    pipeline: PipelineHandle,
    binding_set: BindingSetHandle,
    shader_table: ShaderTable,
    state: FrameState,
    frame: u64,
}

impl<D: RayTracingDevice> FrameDriver<D> {
    /// Uploads the scene, builds its acceleration structures and the
    /// pipeline. Every setup submission is flushed before this returns.
    pub fn new(
        mut device: D,
        config: RendererConfig,
        scene: &SphereScene,
        shaders: &ShaderLibrary,
        camera: Box<dyn CameraSource>,
    ) -> Result<Self> {
        config.validate()?;
        let capabilities = device.capabilities().clone();
        if config.max_recursion_depth > capabilities.max_recursion_depth {
            return Err(RenderError::CapabilityMissing(format!(
                "{} supports a recursion depth of {}, {} requested",
                capabilities.adapter_name,
                capabilities.max_recursion_depth,
                config.max_recursion_depth
            )));
        }
        log::info!(
            "rendering {}x{} on {}",
            config.width,
            config.height,
            capabilities.adapter_name
        );

        let mut tracker = ResourceStateTracker::new();
        let mut fence = Fence::new();
        let mut ring = FrameRing::new(&mut device, &mut tracker)?;
        let mut list = CommandList::new();

        let mut bindings = GlobalBindings::new(
            &mut device,
            &mut tracker,
            scene,
            config.width,
            config.height,
            ring.len(),
        )?;

        let slot = Self::begin_slot(&mut device, &mut ring, &mut fence, &mut list)?;
        let ticket = bindings.upload_noise(
            &mut device,
            &mut tracker,
            &mut fence,
            &mut list,
            config.width,
            config.height,
            config.noise_seed,
        )?;
        ring.mark_submitted(slot, ticket);

        let slot = Self::begin_slot(&mut device, &mut ring, &mut fence, &mut list)?;
        let mut builder = AccelerationStructureBuilder::new();
        let (bottom, top) = builder.build_scene(&mut device, &mut tracker, &mut list, scene)?;
        let ticket = fence.submit(&mut device, &mut list)?;
        fence.flush(&mut device)?;
        builder.release_transients(&mut device, &mut tracker)?;
        ring.mark_submitted(slot, ticket);
        bindings.attach_acceleration_structures(bottom, top);

        let pipeline = device.create_pipeline(&ray_tracing_pipeline(shaders, &config)?)?;
        let materials = bindings.materials_address(&device)?;
        let shader_table = ShaderTable::build(
            &mut device,
            pipeline,
            ShaderTableRecords {
                ray_generation: exports::RAY_GENERATION,
                miss: exports::MISS,
                hit_group: exports::HIT_GROUP,
            },
            &materials.to_le_bytes(),
        )?;
        let binding_set = bindings.create_binding_set(&mut device, pipeline)?;

        Ok(Self {
            device: Some(device),
            config,
            camera,
            tracker,
            fence,
            ring,
            list,
            bindings,
            pipeline,
            binding_set,
            shader_table,
            state: FrameState::Idle,
            frame: 0,
        })
    }

    fn begin_slot(
        device: &mut D,
        ring: &mut FrameRing,
        fence: &mut Fence,
        list: &mut CommandList,
    ) -> Result<usize> {
        let slot = ring.acquire(device)?;
        ring.reclaim(device, fence, slot)?;
        list.begin(ring.slot(slot).allocator);
        Ok(slot)
    }

    /// Renders one frame and queues it for presentation.
    pub fn tick(&mut self, delta: f32) -> Result<FrameStats> {
        let Self {
            device,
            config,
            camera,
            tracker,
            fence,
            ring,
            list,
            bindings,
            pipeline,
            binding_set,
            shader_table,
            state,
            frame,
        } = self;
        let device = device
            .as_mut()
            .ok_or_else(|| DeviceCallError::at_caller("tick", "frame driver is shut down"))?;

        // Waits only when the designated slot still has work in flight.
        let slot = ring.acquire(device)?;
        let outcome = ring.reclaim(device, fence, slot)?;
        list.begin(ring.slot(slot).allocator);
        *state = FrameState::Recording;

        let target = ring.slot(slot).target;
        let recorded = (|| -> Result<()> {
            let constants =
                RayTracingConstants::new(&camera.view_projection(), &camera.eye(), *frame as u32);
            let constants_offset = bindings.write_constants(device, slot, &constants)?;
            let output = bindings.output();

            tracker.transition(
                list,
                output,
                ResourceState::CopySource,
                ResourceState::UnorderedAccess,
            )?;
            list.record(Command::SetPipeline(*pipeline));
            list.record(Command::BindGlobals {
                bindings: *binding_set,
                constants_offset,
            });
            list.record(Command::DispatchRays(
                shader_table.dispatch_desc(config.width, config.height),
            ));
            tracker.transition(
                list,
                output,
                ResourceState::UnorderedAccess,
                ResourceState::CopySource,
            )?;

            tracker.transition(
                list,
                target,
                ResourceState::Present,
                ResourceState::CopyDestination,
            )?;
            list.record(Command::CopyTexture {
                source: output,
                destination: target,
            });
            tracker.transition(
                list,
                target,
                ResourceState::CopyDestination,
                ResourceState::Present,
            )
            .map(|_| ())
        })();
        if let Err(error) = recorded {
            // Nothing reached the device; the slot is reclaimed again next tick.
            if let Some(discarded) = list.close() {
                tracker.rollback(&discarded.commands);
            }
            *state = FrameState::Idle;
            return Err(error);
        }

        let ticket = fence.submit(device, list)?;
        ring.mark_submitted(slot, ticket);
        *state = FrameState::Submitted;

        device.present()?;
        *state = FrameState::Presented;

        camera.advance(delta);
        *frame += 1;
        *state = FrameState::Idle;

        log::trace!("frame {} on slot {} as ticket {}", frame, slot, ticket.value());
        Ok(FrameStats {
            frame: *frame,
            slot,
            ticket,
            blocked: outcome == WaitOutcome::Blocked,
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frames(&self) -> u64 {
        self.frame
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn ring(&self) -> &FrameRing {
        &self.ring
    }

    pub fn bindings(&self) -> &GlobalBindings {
        &self.bindings
    }

    pub fn shader_table(&self) -> &ShaderTable {
        &self.shader_table
    }

    pub fn pipeline(&self) -> PipelineHandle {
        self.pipeline
    }

    pub fn tracker(&self) -> &ResourceStateTracker {
        &self.tracker
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> Option<&mut D> {
        self.device.as_mut()
    }

    /// Flushes all outstanding work and hands the device back.
    pub fn shutdown(mut self) -> Result<D> {
        let mut device = self
            .device
            .take()
            .ok_or_else(|| DeviceCallError::at_caller("shutdown", "frame driver is shut down"))?;
        let ticket = self.fence.flush(&mut device)?;
        log::info!(
            "shut down after {} frames, gpu idle at ticket {}",
            self.frame,
            ticket.value()
        );
        Ok(device)
    }
}

impl<D: RayTracingDevice> Drop for FrameDriver<D> {
    fn drop(&mut self) {
        if let Some(device) = self.device.as_mut() {
            if let Err(error) = self.fence.flush(device) {
                log::error!("flush on drop failed: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::FixedCamera;
    use crate::headless::{GpuProgress, HeadlessDevice};

    fn driver(progress: GpuProgress) -> FrameDriver<HeadlessDevice> {
        let config = RendererConfig {
            width: 16,
            height: 8,
            ..RendererConfig::default()
        };
        let device = HeadlessDevice::new(16, 8, 3, progress);
        let shaders = ShaderLibrary::empty_modules(&exports::SHADERS);
        let camera = Box::new(FixedCamera::default_view(config.aspect_ratio()));
        FrameDriver::new(device, config, &SphereScene::default(), &shaders, camera).unwrap()
    }

    #[test]
    fn setup_flushes_before_the_first_tick() {
        let driver = driver(GpuProgress::Stalled);
        let device = driver.device().unwrap();
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(driver.fence().last_signaled(), Ticket(4));
        assert_eq!(driver.state(), FrameState::Idle);
    }

    #[test]
    fn tick_returns_to_idle_with_the_next_ticket() {
        let mut driver = driver(GpuProgress::Immediate);
        let stats = driver.tick(0.016).unwrap();
        assert_eq!(stats.frame, 1);
        assert_eq!(stats.ticket, Ticket(5));
        assert!(!stats.blocked);
        assert_eq!(driver.state(), FrameState::Idle);
        assert_eq!(
            driver.tracker().state(driver.bindings().output()),
            Some(ResourceState::CopySource)
        );
    }

    #[test]
    fn recursion_beyond_the_device_limit_is_a_capability_error() {
        let config = RendererConfig {
            width: 16,
            height: 8,
            max_recursion_depth: 31,
            ..RendererConfig::default()
        };
        let mut device = HeadlessDevice::new(16, 8, 3, GpuProgress::Immediate);
        device.set_max_recursion_depth(4);
        let shaders = ShaderLibrary::empty_modules(&exports::SHADERS);
        let camera = Box::new(FixedCamera::default_view(2.0));
        let result = FrameDriver::new(device, config, &SphereScene::default(), &shaders, camera);
        assert!(matches!(result, Err(RenderError::CapabilityMissing(_))));
    }

    #[test]
    fn shutdown_leaves_no_work_in_flight() {
        let mut driver = driver(GpuProgress::Stalled);
        for _ in 0..2 {
            driver.tick(0.016).unwrap();
        }
        let device = driver.shutdown().unwrap();
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.dispatches_executed(), 2);
    }
}
