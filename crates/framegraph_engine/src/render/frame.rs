//! Frame scheduler
//!
//! Drives the ring of frame slots through `Idle -> Acquiring -> Recording ->
//! Submitted` and back. The scheduler owns the policy (which slot is current,
//! when the fence is reset, when the swapchain is rebuilt); a [`FrameBackend`]
//! owns the Vulkan objects. Frame `i` always uses slot `i mod N`, and a slot's
//! fence is waited on before anything in that slot is touched again, so the
//! CPU can run at most N frames ahead of the GPU.
//!
//! ```text
//! begin_render_frame:  wait fence -> acquire -> (out of date? rebuild, skip)
//!                      -> reset fence -> begin commands -> ActiveFrame
//! finish_render_frame: end commands -> submit -> present
//!                      -> (out of date / suboptimal / resized? rebuild)
//!                      -> advance slot
//! abort_render_frame:  discard commands -> submit a present-only batch
//!                      -> advance slot
//! ```

use ash::vk;

use crate::render::backends::vulkan::{VulkanError, VulkanResult};

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready once the slot's acquire semaphore signals
    Acquired {
        /// Swapchain image index
        image_index: u32,
        /// The swapchain still works but no longer matches the surface
        suboptimal: bool,
    },
    /// The swapchain must be rebuilt before anything can be presented
    OutOfDate,
}

/// Result of queueing a present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swapchain should be rebuilt
    Suboptimal,
    /// Not presented; the swapchain must be rebuilt
    OutOfDate,
}

/// Per-slot lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signaled (or about to be waited on); nothing in flight from the CPU side
    Idle,
    /// Fence waited, image being acquired
    Acquiring,
    /// Command buffer open
    Recording,
    /// Work queued on the GPU; the fence guards reuse
    Submitted,
}

/// Vulkan objects behind the frame ring
///
/// Implemented by the Vulkan backend and by test doubles.
pub trait FrameBackend {
    /// Number of frame slots
    fn slot_count(&self) -> usize;

    /// Block until the slot's in-flight fence is signaled
    fn wait_for_slot(&mut self, slot: usize) -> VulkanResult<()>;

    /// Acquire the next swapchain image, signaling the slot's acquire semaphore
    fn acquire_image(&mut self, slot: usize) -> VulkanResult<AcquireOutcome>;

    /// Return the slot's fence to unsignaled
    fn reset_slot_fence(&mut self, slot: usize) -> VulkanResult<()>;

    /// Reset and begin the slot's command buffer, set viewport/scissor and
    /// make the swapchain image writable as a color attachment
    fn begin_commands(&mut self, slot: usize, image_index: u32, extent: vk::Extent2D) -> VulkanResult<vk::CommandBuffer>;

    /// Transition the image for presentation, end, submit and present
    fn submit_and_present(&mut self, slot: usize, image_index: u32) -> VulkanResult<PresentOutcome>;

    /// Throw away whatever the slot recorded, then submit a batch that only
    /// hands the acquired image back to the presentation engine. Consumes the
    /// acquire semaphore and signals the slot's fence like a normal submit.
    fn discard_and_present(&mut self, slot: usize, image_index: u32) -> VulkanResult<PresentOutcome>;

    /// Block until the device is idle
    fn wait_idle(&mut self) -> VulkanResult<()>;

    /// Destroy the depth attachment
    fn destroy_depth_resource(&mut self);

    /// Destroy the swapchain and its image views
    fn destroy_swapchain(&mut self);

    /// Build a swapchain for the requested extent; returns the actual extent
    fn create_swapchain(&mut self, requested: vk::Extent2D) -> VulkanResult<vk::Extent2D>;

    /// Build the depth attachment for the swapchain extent
    fn create_depth_resource(&mut self, extent: vk::Extent2D) -> VulkanResult<()>;
}

/// A frame between `begin_render_frame` and `finish_render_frame`
#[derive(Debug)]
pub struct ActiveFrame {
    /// Slot index (`frame_number mod N`)
    pub slot: usize,
    /// Acquired swapchain image
    pub image_index: u32,
    /// Primary command buffer, already begun
    pub command_buffer: vk::CommandBuffer,
    /// Swapchain extent
    pub extent: vk::Extent2D,
    /// Frames begun successfully before this one
    pub frame_number: u64,
    /// Depth from the previous frame is valid for this swapchain
    pub history_valid: bool,
}

/// Frame ring state machine
pub struct FrameScheduler<B: FrameBackend> {
    backend: B,
    slots: Vec<SlotState>,
    frame_id: usize,
    frame_number: u64,
    extent: vk::Extent2D,
    requested_extent: vk::Extent2D,
    resize_requested: bool,
    swapchain_generation: u64,
    last_presented_generation: Option<u64>,
}

impl<B: FrameBackend> FrameScheduler<B> {
    /// Wrap a backend whose swapchain was created at `extent`
    pub fn new(backend: B, extent: vk::Extent2D) -> Self {
        let slot_count = backend.slot_count();
        debug_assert!(slot_count > 0, "frame ring needs at least one slot");
        Self {
            backend,
            slots: vec![SlotState::Idle; slot_count],
            frame_id: 0,
            frame_number: 0,
            extent,
            requested_extent: extent,
            resize_requested: false,
            swapchain_generation: 0,
            last_presented_generation: None,
        }
    }

    /// Start a frame on the current slot
    ///
    /// Returns `Ok(None)` when the swapchain was out of date; it has been
    /// rebuilt (or the rebuild deferred) and nothing was recorded.
    pub fn begin_render_frame(&mut self) -> VulkanResult<Option<ActiveFrame>> {
        let slot = self.frame_id;
        if self.slots[slot] != SlotState::Idle && self.slots[slot] != SlotState::Submitted {
            return Err(VulkanError::InvalidOperation {
                reason: format!("slot {slot} is already {:?}", self.slots[slot]),
            });
        }

        if self.resize_requested {
            self.recreate_swapchain()?;
            if self.resize_requested {
                return Ok(None);
            }
        }

        self.backend.wait_for_slot(slot)?;
        self.slots[slot] = SlotState::Acquiring;

        let image_index = match self.backend.acquire_image(slot) {
            Ok(AcquireOutcome::Acquired { image_index, suboptimal }) => {
                if suboptimal {
                    self.resize_requested = true;
                }
                image_index
            }
            Ok(AcquireOutcome::OutOfDate) => {
                self.slots[slot] = SlotState::Idle;
                log::warn!("Swapchain out of date on acquire; skipping frame {}", self.frame_number);
                self.recreate_swapchain()?;
                return Ok(None);
            }
            Err(e) => {
                self.slots[slot] = SlotState::Idle;
                return Err(e);
            }
        };

        // Only reset once an image is guaranteed, otherwise the next wait deadlocks
        self.backend.reset_slot_fence(slot)?;
        let command_buffer = self.backend.begin_commands(slot, image_index, self.extent)?;
        self.slots[slot] = SlotState::Recording;

        let frame = ActiveFrame {
            slot,
            image_index,
            command_buffer,
            extent: self.extent,
            frame_number: self.frame_number,
            history_valid: self.last_presented_generation == Some(self.swapchain_generation),
        };
        self.frame_number += 1;
        log::trace!("Begin frame {} on slot {} (image {})", frame.frame_number, slot, image_index);
        Ok(Some(frame))
    }

    /// Submit and present a frame started by [`Self::begin_render_frame`]
    pub fn finish_render_frame(&mut self, frame: ActiveFrame) -> VulkanResult<PresentOutcome> {
        if frame.slot != self.frame_id || self.slots[frame.slot] != SlotState::Recording {
            return Err(VulkanError::InvalidOperation {
                reason: format!("frame for slot {} is not the one being recorded", frame.slot),
            });
        }

        let outcome = self.backend.submit_and_present(frame.slot, frame.image_index)?;
        self.slots[frame.slot] = SlotState::Submitted;
        self.frame_id = (self.frame_id + 1) % self.slots.len();

        match outcome {
            PresentOutcome::Presented => {
                self.last_presented_generation = Some(self.swapchain_generation);
            }
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                log::warn!("Swapchain {:?} on present", outcome);
                self.resize_requested = true;
            }
        }

        if self.resize_requested {
            self.recreate_swapchain()?;
        }

        Ok(outcome)
    }

    /// Drop a frame whose recording failed
    ///
    /// The slot's fence was already reset by [`Self::begin_render_frame`], so
    /// the slot must still be submitted for its next wait to return. Depth
    /// history is invalidated since the frame never finished writing it.
    pub fn abort_render_frame(&mut self, frame: ActiveFrame) -> VulkanResult<()> {
        if frame.slot != self.frame_id || self.slots[frame.slot] != SlotState::Recording {
            return Err(VulkanError::InvalidOperation {
                reason: format!("frame for slot {} is not the one being recorded", frame.slot),
            });
        }

        log::warn!("Aborting frame {} on slot {}", frame.frame_number, frame.slot);
        let outcome = self.backend.discard_and_present(frame.slot, frame.image_index)?;
        self.slots[frame.slot] = SlotState::Submitted;
        self.frame_id = (self.frame_id + 1) % self.slots.len();
        self.last_presented_generation = None;

        if outcome != PresentOutcome::Presented {
            self.resize_requested = true;
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    /// Rebuild the swapchain and depth attachment at the requested extent
    ///
    /// Returns `false` when the framebuffer has zero area; the rebuild stays
    /// pending until a later call sees a usable size.
    pub fn recreate_swapchain(&mut self) -> VulkanResult<bool> {
        if self.requested_extent.width == 0 || self.requested_extent.height == 0 {
            log::debug!("Framebuffer has zero area; deferring swapchain recreation");
            self.resize_requested = true;
            return Ok(false);
        }

        self.backend.wait_idle()?;
        for state in &mut self.slots {
            *state = SlotState::Idle;
        }

        self.backend.destroy_depth_resource();
        self.backend.destroy_swapchain();
        self.extent = self.backend.create_swapchain(self.requested_extent)?;
        self.backend.create_depth_resource(self.extent)?;

        self.swapchain_generation += 1;
        self.resize_requested = false;
        log::info!(
            "Swapchain recreated at {}x{} (generation {})",
            self.extent.width,
            self.extent.height,
            self.swapchain_generation
        );
        Ok(true)
    }

    /// Record a new framebuffer size; the swapchain is rebuilt at the next frame boundary
    pub fn notify_framebuffer_resized(&mut self, width: u32, height: u32) {
        self.requested_extent = vk::Extent2D { width, height };
        self.resize_requested = true;
    }

    /// Block until all submitted work completes
    pub fn wait_idle(&mut self) -> VulkanResult<()> {
        self.backend.wait_idle()?;
        for state in &mut self.slots {
            *state = SlotState::Idle;
        }
        Ok(())
    }

    /// Shared access to the backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Current swapchain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Slot the next frame will use
    pub fn current_slot(&self) -> usize {
        self.frame_id
    }

    /// State of a slot
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    /// Incremented on every successful swapchain rebuild
    pub fn swapchain_generation(&self) -> u64 {
        self.swapchain_generation
    }

    /// True while a rebuild is pending
    pub fn resize_pending(&self) -> bool {
        self.resize_requested
    }

    /// Frames begun so far
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FenceState {
        Signaled,
        Unsignaled,
        Pending,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Begin(usize, u32),
        Submit(usize, u32),
        Discard(usize, u32),
        WaitIdle,
        DestroyDepth,
        DestroySwapchain,
        CreateSwapchain(u32, u32),
        CreateDepth(u32, u32),
    }

    struct MockBackend {
        fences: Vec<FenceState>,
        calls: Vec<Call>,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
        next_image: u32,
        image_count: u32,
    }

    impl MockBackend {
        fn new(slots: usize) -> Self {
            Self {
                fences: vec![FenceState::Signaled; slots],
                calls: Vec::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                next_image: 0,
                image_count: 3,
            }
        }
    }

    impl FrameBackend for MockBackend {
        fn slot_count(&self) -> usize {
            self.fences.len()
        }

        fn wait_for_slot(&mut self, slot: usize) -> VulkanResult<()> {
            self.calls.push(Call::Wait(slot));
            match self.fences[slot] {
                // The GPU finishes whatever it was given
                FenceState::Pending | FenceState::Signaled => {
                    self.fences[slot] = FenceState::Signaled;
                    Ok(())
                }
                FenceState::Unsignaled => Err(VulkanError::Api(vk::Result::TIMEOUT)),
            }
        }

        fn acquire_image(&mut self, slot: usize) -> VulkanResult<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            if let Some(outcome) = self.acquire_script.pop_front() {
                return Ok(outcome);
            }
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquireOutcome::Acquired { image_index, suboptimal: false })
        }

        fn reset_slot_fence(&mut self, slot: usize) -> VulkanResult<()> {
            assert_eq!(self.fences[slot], FenceState::Signaled, "fence reset before it signaled");
            self.calls.push(Call::Reset(slot));
            self.fences[slot] = FenceState::Unsignaled;
            Ok(())
        }

        fn begin_commands(&mut self, slot: usize, image_index: u32, _extent: vk::Extent2D) -> VulkanResult<vk::CommandBuffer> {
            self.calls.push(Call::Begin(slot, image_index));
            Ok(vk::CommandBuffer::null())
        }

        fn submit_and_present(&mut self, slot: usize, image_index: u32) -> VulkanResult<PresentOutcome> {
            self.calls.push(Call::Submit(slot, image_index));
            self.fences[slot] = FenceState::Pending;
            Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn discard_and_present(&mut self, slot: usize, image_index: u32) -> VulkanResult<PresentOutcome> {
            self.calls.push(Call::Discard(slot, image_index));
            self.fences[slot] = FenceState::Pending;
            Ok(PresentOutcome::Presented)
        }

        fn wait_idle(&mut self) -> VulkanResult<()> {
            self.calls.push(Call::WaitIdle);
            for fence in &mut self.fences {
                if *fence == FenceState::Pending {
                    *fence = FenceState::Signaled;
                }
            }
            Ok(())
        }

        fn destroy_depth_resource(&mut self) {
            self.calls.push(Call::DestroyDepth);
        }

        fn destroy_swapchain(&mut self) {
            self.calls.push(Call::DestroySwapchain);
        }

        fn create_swapchain(&mut self, requested: vk::Extent2D) -> VulkanResult<vk::Extent2D> {
            self.calls.push(Call::CreateSwapchain(requested.width, requested.height));
            Ok(requested)
        }

        fn create_depth_resource(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
            self.calls.push(Call::CreateDepth(extent.width, extent.height));
            Ok(())
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn scheduler(slots: usize) -> FrameScheduler<MockBackend> {
        FrameScheduler::new(MockBackend::new(slots), extent(800, 600))
    }

    fn run_frame(s: &mut FrameScheduler<MockBackend>) -> Option<usize> {
        let frame = s.begin_render_frame().unwrap()?;
        let slot = frame.slot;
        s.finish_render_frame(frame).unwrap();
        Some(slot)
    }

    #[test]
    fn test_slots_cycle_modulo_ring_size() {
        for n in 1..=3 {
            let mut s = scheduler(n);
            let slots: Vec<usize> = (0..7).filter_map(|_| run_frame(&mut s)).collect();
            let expected: Vec<usize> = (0..7).map(|i| i % n).collect();
            assert_eq!(slots, expected);
        }
    }

    #[test]
    fn test_fence_waited_before_slot_reuse() {
        let mut s = scheduler(2);
        for _ in 0..4 {
            run_frame(&mut s);
        }
        let calls = &s.backend().calls;
        // Every reset is immediately preceded by this slot's wait and acquire
        for (i, call) in calls.iter().enumerate() {
            if let Call::Reset(slot) = call {
                assert_eq!(calls[i - 2], Call::Wait(*slot));
                assert_eq!(calls[i - 1], Call::Acquire(*slot));
            }
        }
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Submit(..))).count(), 4);
    }

    #[test]
    fn test_begin_twice_without_finish_is_rejected() {
        let mut s = scheduler(2);
        let _frame = s.begin_render_frame().unwrap().unwrap();
        assert!(matches!(s.begin_render_frame(), Err(VulkanError::InvalidOperation { .. })));
    }

    #[test]
    fn test_aborted_frame_releases_its_slot() {
        let mut s = scheduler(2);
        let frame = s.begin_render_frame().unwrap().unwrap();
        assert_eq!(frame.slot, 0);
        s.abort_render_frame(frame).unwrap();
        assert_eq!(s.slot_state(0), SlotState::Submitted);
        assert_eq!(s.current_slot(), 1);

        let next = s.begin_render_frame().unwrap().unwrap();
        assert_eq!(next.slot, 1);
        assert!(!next.history_valid);
        s.finish_render_frame(next).unwrap();

        // Back round to slot 0; its wait must not time out
        let again = s.begin_render_frame().unwrap().unwrap();
        assert_eq!(again.slot, 0);

        let calls = &s.backend().calls;
        let discard = calls.iter().position(|c| *c == Call::Discard(0, 0)).unwrap();
        let rewait = calls.iter().rposition(|c| *c == Call::Wait(0)).unwrap();
        assert!(discard < rewait);
        assert!(!calls.contains(&Call::Submit(0, 0)));
    }

    #[test]
    fn test_abort_rejects_frame_not_being_recorded() {
        let mut s = scheduler(2);
        let frame = s.begin_render_frame().unwrap().unwrap();
        let stale = ActiveFrame { slot: 1, ..frame };
        assert!(matches!(s.abort_render_frame(stale), Err(VulkanError::InvalidOperation { .. })));
        assert_eq!(s.slot_state(0), SlotState::Recording);
    }

    #[test]
    fn test_saturated_ring_waits_before_reusing_command_buffer() {
        let slots = 3;
        let mut s = scheduler(slots);
        // Submit N frames whose fences the GPU has not signaled yet
        for _ in 0..slots {
            run_frame(&mut s);
        }
        assert!((0..slots).all(|slot| s.slot_state(slot) == SlotState::Submitted));
        s.backend_mut().calls.clear();

        let frame = s.begin_render_frame().unwrap().unwrap();
        assert_eq!(frame.slot, 0);
        let calls = &s.backend().calls;
        let wait = calls.iter().position(|c| *c == Call::Wait(0)).unwrap();
        let begin = calls.iter().position(|c| matches!(c, Call::Begin(0, _))).unwrap();
        assert!(wait < begin);
        // No other slot's command buffer was reopened while slot 0 was reused
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Begin(..))).count(), 1);
    }

    #[test]
    fn test_unsignaled_fence_blocks_slot_reuse() {
        let mut s = scheduler(2);
        run_frame(&mut s);
        run_frame(&mut s);
        // The GPU never finishes slot 0's work
        s.backend_mut().fences[0] = FenceState::Unsignaled;

        assert!(matches!(s.begin_render_frame(), Err(VulkanError::Api(vk::Result::TIMEOUT))));
        let calls = &s.backend().calls;
        assert_eq!(calls.last(), Some(&Call::Wait(0)));
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Begin(0, _))).count(), 1);
    }

    #[test]
    fn test_out_of_date_acquire_recreates_and_skips() {
        let mut s = scheduler(2);
        s.notify_framebuffer_resized(1024, 768);
        // The pending resize is handled first; then the acquire itself reports out of date
        s.backend_mut().acquire_script.push_back(AcquireOutcome::OutOfDate);

        assert!(s.begin_render_frame().unwrap().is_none());
        assert_eq!(s.extent(), extent(1024, 768));

        let calls = &s.backend().calls;
        assert!(!calls.iter().any(|c| matches!(c, Call::Submit(..) | Call::Reset(_) | Call::Begin(..))));
        let creates = calls.iter().filter(|c| matches!(c, Call::CreateSwapchain(..))).count();
        let depths = calls.iter().filter(|c| matches!(c, Call::CreateDepth(..))).count();
        assert_eq!(creates, 2);
        assert_eq!(depths, 2);

        // The fence was never reset, so the same slot is usable immediately
        assert_eq!(s.current_slot(), 0);
        assert_eq!(run_frame(&mut s), Some(0));
    }

    #[test]
    fn test_resize_scenario_rebuilds_once() {
        let mut s = scheduler(2);
        run_frame(&mut s);
        s.backend_mut().calls.clear();
        s.backend_mut().acquire_script.push_back(AcquireOutcome::OutOfDate);

        assert!(s.begin_render_frame().unwrap().is_none());

        assert_eq!(
            s.backend().calls,
            vec![
                Call::Wait(1),
                Call::Acquire(1),
                Call::WaitIdle,
                Call::DestroyDepth,
                Call::DestroySwapchain,
                Call::CreateSwapchain(800, 600),
                Call::CreateDepth(800, 600),
            ]
        );
        assert_eq!(s.swapchain_generation(), 1);
        assert!(!s.resize_pending());
    }

    #[test]
    fn test_suboptimal_present_triggers_rebuild() {
        let mut s = scheduler(2);
        s.backend_mut().present_script.push_back(PresentOutcome::Suboptimal);
        let frame = s.begin_render_frame().unwrap().unwrap();
        assert_eq!(s.finish_render_frame(frame).unwrap(), PresentOutcome::Suboptimal);
        assert_eq!(s.swapchain_generation(), 1);
        assert_eq!(s.current_slot(), 1);
    }

    #[test]
    fn test_resize_flag_rebuilds_at_frame_boundary() {
        let mut s = scheduler(2);
        let frame = s.begin_render_frame().unwrap().unwrap();
        s.notify_framebuffer_resized(640, 480);
        s.finish_render_frame(frame).unwrap();
        assert_eq!(s.extent(), extent(640, 480));
        assert!(!s.resize_pending());
    }

    #[test]
    fn test_zero_area_defers_recreation() {
        let mut s = scheduler(2);
        s.notify_framebuffer_resized(0, 0);
        assert!(s.begin_render_frame().unwrap().is_none());
        assert!(s.resize_pending());
        assert_eq!(s.swapchain_generation(), 0);
        assert!(!s.backend().calls.contains(&Call::DestroySwapchain));

        s.notify_framebuffer_resized(320, 200);
        assert!(s.begin_render_frame().unwrap().is_some());
        assert_eq!(s.extent(), extent(320, 200));
    }

    #[test]
    fn test_history_invalid_after_rebuild() {
        let mut s = scheduler(2);
        let first = s.begin_render_frame().unwrap().unwrap();
        assert!(!first.history_valid);
        s.finish_render_frame(first).unwrap();

        let second = s.begin_render_frame().unwrap().unwrap();
        assert!(second.history_valid);
        s.finish_render_frame(second).unwrap();

        s.notify_framebuffer_resized(400, 300);
        let third = s.begin_render_frame().unwrap().unwrap();
        assert!(!third.history_valid);
        assert_eq!(third.frame_number, 2);
    }
}
