//! Frame pacing: acquire, submit and present across frame slots
//!
//! Synchronization objects are indexed by *frame slot* (`0..frames_in_flight`)
//! while command buffers and the image-in-flight table are indexed by
//! *swapchain image*. [`FrameScheduler`] keeps the two apart:
//!
//! 1. wait on every frame slot's fence, acquire with the current slot's semaphore
//! 2. (caller records into the acquired image's command buffer)
//! 3. if the image is still owned by another slot's fence, wait on that fence
//! 4. reset the slot fence, submit, record the current slot as the image's owner
//! 5. present, then advance the slot round-robin
//!
//! A failed submit skips the slot instead: its fence is signaled by an empty
//! submit, and the loop rebuilds the target before the next acquire because
//! the abandoned image can never be presented.
//!
//! [`FrameTarget`] is the seam to the swapchain so the ordering and the
//! recreation path can be driven by a mock.

use ash::vk;

use crate::error::{VulkanError, VulkanResult};

/// Result of acquiring the next swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    /// An image is ready; `suboptimal` frames are still rendered
    Acquired {
        /// Index of the acquired image
        image_index: u32,
        /// Surface no longer matches exactly
        suboptimal: bool,
    },
    /// The swapchain must be recreated before rendering
    OutOfDate,
}

/// Result of presenting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    /// Presented and still matching the surface
    Optimal,
    /// Presented, but the swapchain should be recreated
    Suboptimal,
    /// Not presented; the swapchain must be recreated
    OutOfDate,
}

impl PresentStatus {
    /// Whether the swapchain should be rebuilt
    pub const fn needs_recreation(self) -> bool {
        !matches!(self, Self::Optimal)
    }
}

/// What the frame loop needs from a swapchain
pub trait FrameTarget: Sized {
    /// Number of frame slots
    fn frames_in_flight(&self) -> usize;

    /// Number of presentable images
    fn image_count(&self) -> usize;

    /// Current image extent
    fn extent(&self) -> vk::Extent2D;

    /// Block until every frame slot's fence is signaled
    fn wait_for_frame_fences(&self) -> VulkanResult<()>;

    /// Acquire an image, signaling `frame`'s image-available semaphore
    fn acquire_next_image(&self, frame: usize) -> VulkanResult<AcquireStatus>;

    /// Block until `frame`'s fence is signaled
    fn wait_for_fence(&self, frame: usize) -> VulkanResult<()>;

    /// Unsignal `frame`'s fence
    fn reset_fence(&self, frame: usize) -> VulkanResult<()>;

    /// Submit `command_buffer` with `frame`'s semaphores, signaling `frame`'s fence
    fn submit(&self, frame: usize, command_buffer: vk::CommandBuffer) -> VulkanResult<()>;

    /// Give up on `frame` after its image was acquired: consume the
    /// image-available semaphore and leave `frame`'s fence signaled
    fn skip_frame(&self, frame: usize) -> VulkanResult<()>;

    /// Present `image_index` after `frame`'s render-finished semaphore
    fn present(&self, frame: usize, image_index: u32) -> VulkanResult<PresentStatus>;

    /// Block until the device is idle
    fn wait_idle(&self) -> VulkanResult<()>;

    /// Tear this target down completely and build a new one at `extent`
    fn rebuild(self, extent: vk::Extent2D) -> VulkanResult<Self>;
}

/// Frame-slot round robin and image ownership bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameScheduler {
    frames_in_flight: usize,
    current_frame: usize,
    images_in_flight: Vec<Option<usize>>,
    acquired: Option<u32>,
    abandoned: bool,
}

impl FrameScheduler {
    /// Scheduler for `frames_in_flight` slots over `image_count` images
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            current_frame: 0,
            images_in_flight: vec![None; image_count],
            acquired: None,
            abandoned: false,
        }
    }

    /// Forget all ownership after the target was rebuilt
    pub fn reset(&mut self, frames_in_flight: usize, image_count: usize) {
        *self = Self::new(frames_in_flight, image_count);
    }

    /// Frame slot used by the next acquire/submit
    pub const fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Number of frame slots
    pub const fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Image acquired and not yet submitted
    pub const fn acquired_image(&self) -> Option<u32> {
        self.acquired
    }

    /// Frame slot whose fence last covered `image_index`
    pub fn image_owner(&self, image_index: u32) -> Option<usize> {
        self.images_in_flight.get(image_index as usize).copied().flatten()
    }

    /// Wait for the slots, then acquire; `None` means the target is out of date
    pub fn acquire<T: FrameTarget>(&mut self, target: &T) -> VulkanResult<Option<u32>> {
        target.wait_for_frame_fences()?;

        match target.acquire_next_image(self.current_frame)? {
            AcquireStatus::Acquired { image_index, suboptimal } => {
                if image_index as usize >= self.images_in_flight.len() {
                    return Err(VulkanError::invalid(format!(
                        "acquired image {image_index} but only {} images exist",
                        self.images_in_flight.len()
                    )));
                }
                if suboptimal {
                    log::debug!("Acquired image {image_index} from a suboptimal swapchain");
                }
                self.acquired = Some(image_index);
                Ok(Some(image_index))
            }
            AcquireStatus::OutOfDate => {
                log::warn!("Swapchain out of date during acquire");
                self.acquired = None;
                Ok(None)
            }
        }
    }

    /// Submit `command_buffer` for the acquired image, present it and advance the slot
    ///
    /// If the submit fails the slot is skipped so its fence ends up signaled
    /// again, and the acquired image is marked abandoned.
    pub fn submit<T: FrameTarget>(&mut self, target: &T, command_buffer: vk::CommandBuffer) -> VulkanResult<PresentStatus> {
        let image_index = self
            .acquired
            .take()
            .ok_or_else(|| VulkanError::invalid("submit without an acquired image"))?;
        let frame = self.current_frame;

        if let Err(err) = self.submit_acquired(target, frame, image_index, command_buffer) {
            log::error!("Submitting frame slot {frame} failed: {err}");
            self.skip(target, frame, image_index);
            return Err(err);
        }
        let status = target.present(frame, image_index)?;

        self.current_frame = (frame + 1) % self.frames_in_flight;
        Ok(status)
    }

    /// Drop the acquired image without submitting anything for it
    pub fn abandon<T: FrameTarget>(&mut self, target: &T) {
        if let Some(image_index) = self.acquired.take() {
            self.skip(target, self.current_frame, image_index);
        }
    }

    /// An acquired image was never presented; only a rebuild releases it
    pub const fn has_abandoned_image(&self) -> bool {
        self.abandoned
    }

    fn submit_acquired<T: FrameTarget>(
        &mut self,
        target: &T,
        frame: usize,
        image_index: u32,
        command_buffer: vk::CommandBuffer,
    ) -> VulkanResult<()> {
        if let Some(owner) = self.images_in_flight[image_index as usize] {
            target.wait_for_fence(owner)?;
        }
        target.reset_fence(frame)?;
        target.submit(frame, command_buffer)?;
        self.images_in_flight[image_index as usize] = Some(frame);
        Ok(())
    }

    fn skip<T: FrameTarget>(&mut self, target: &T, frame: usize, image_index: u32) {
        log::warn!("Abandoning image {image_index} on frame slot {frame}");
        if let Err(err) = target.skip_frame(frame) {
            log::error!("Failed to release frame slot {frame}: {err}");
        }
        self.abandoned = true;
    }
}

/// A frame target plus its scheduler, with the recreation policy
pub struct FrameLoop<T: FrameTarget> {
    target: Option<T>,
    scheduler: FrameScheduler,
    generation: u64,
}

impl<T: FrameTarget> FrameLoop<T> {
    /// Start driving `target`
    pub fn new(target: T) -> Self {
        let scheduler = FrameScheduler::new(target.frames_in_flight(), target.image_count());
        Self { target: Some(target), scheduler, generation: 0 }
    }

    /// The current target
    pub fn target(&self) -> VulkanResult<&T> {
        self.target
            .as_ref()
            .ok_or_else(|| VulkanError::invalid("swapchain unavailable after a failed recreation"))
    }

    /// Scheduler state
    pub const fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    /// Number of completed recreations
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Acquire the next image
    ///
    /// On an out-of-date target, or after an image was abandoned, the
    /// swapchain is rebuilt at the extent returned by `extent` and `None` is
    /// returned; the caller retries on its next tick.
    pub fn begin_frame(&mut self, extent: impl FnOnce() -> vk::Extent2D) -> VulkanResult<Option<u32>> {
        if self.scheduler.has_abandoned_image() {
            self.recreate(extent())?;
            return Ok(None);
        }
        let acquired = {
            let target = self
                .target
                .as_ref()
                .ok_or_else(|| VulkanError::invalid("swapchain unavailable after a failed recreation"))?;
            self.scheduler.acquire(target)?
        };
        if acquired.is_none() {
            self.recreate(extent())?;
        }
        Ok(acquired)
    }

    /// Submit and present, rebuilding when presentation reports a stale
    /// swapchain or `resized` is set. Returns whether a rebuild happened.
    pub fn end_frame(
        &mut self,
        command_buffer: vk::CommandBuffer,
        resized: bool,
        extent: impl FnOnce() -> vk::Extent2D,
    ) -> VulkanResult<bool> {
        let status = {
            let target = self
                .target
                .as_ref()
                .ok_or_else(|| VulkanError::invalid("swapchain unavailable after a failed recreation"))?;
            self.scheduler.submit(target, command_buffer)?
        };

        if status.needs_recreation() || resized {
            log::debug!("Recreating swapchain after present ({status:?}, resized: {resized})");
            self.recreate(extent())?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Release the acquired image when the frame will not be submitted
    pub fn abandon_frame(&mut self) {
        if let Some(target) = &self.target {
            self.scheduler.abandon(target);
        }
    }

    /// Wait idle, drop the old target entirely and build a new one at `extent`
    pub fn recreate(&mut self, extent: vk::Extent2D) -> VulkanResult<()> {
        if let Some(target) = &self.target {
            target.wait_idle()?;
        }
        let old = self
            .target
            .take()
            .ok_or_else(|| VulkanError::invalid("swapchain unavailable after a failed recreation"))?;

        let rebuilt = old.rebuild(extent)?;
        self.scheduler.reset(rebuilt.frames_in_flight(), rebuilt.image_count());
        self.target = Some(rebuilt);
        self.generation += 1;

        log::info!(
            "Swapchain recreated at {}x{} (generation {})",
            extent.width,
            extent.height,
            self.generation
        );
        Ok(())
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> VulkanResult<()> {
        self.target()?.wait_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        WaitAll,
        Acquire(usize),
        WaitFence(usize),
        ResetFence(usize),
        Submit(usize),
        Skip(usize),
        Present(usize, u32),
        WaitIdle,
        Rebuild,
    }

    #[derive(Default)]
    struct Script {
        events: RefCell<Vec<Event>>,
        acquires: RefCell<VecDeque<AcquireStatus>>,
        presents: RefCell<VecDeque<PresentStatus>>,
        sync_destroyed: Cell<usize>,
        failing_submits: Cell<usize>,
    }

    struct MockTarget {
        script: Rc<Script>,
        frames: usize,
        images: usize,
        extent: vk::Extent2D,
        next_image: Cell<u32>,
        signaled: RefCell<Vec<bool>>,
    }

    impl MockTarget {
        fn new(script: &Rc<Script>, frames: usize, images: usize) -> Self {
            Self {
                script: Rc::clone(script),
                frames,
                images,
                extent: vk::Extent2D { width: 800, height: 600 },
                next_image: Cell::new(0),
                signaled: RefCell::new(vec![true; frames]),
            }
        }

        fn log(&self, event: Event) {
            self.script.events.borrow_mut().push(event);
        }
    }

    impl Drop for MockTarget {
        fn drop(&mut self) {
            let destroyed = &self.script.sync_destroyed;
            destroyed.set(destroyed.get() + self.frames);
        }
    }

    impl FrameTarget for MockTarget {
        fn frames_in_flight(&self) -> usize {
            self.frames
        }

        fn image_count(&self) -> usize {
            self.images
        }

        fn extent(&self) -> vk::Extent2D {
            self.extent
        }

        fn wait_for_frame_fences(&self) -> VulkanResult<()> {
            self.log(Event::WaitAll);
            // A real fence wait would never return here.
            if self.signaled.borrow().iter().any(|signaled| !signaled) {
                return Err(VulkanError::invalid("waiting on a fence that is never signaled"));
            }
            Ok(())
        }

        fn acquire_next_image(&self, frame: usize) -> VulkanResult<AcquireStatus> {
            self.log(Event::Acquire(frame));
            if let Some(scripted) = self.script.acquires.borrow_mut().pop_front() {
                return Ok(scripted);
            }
            let image_index = self.next_image.get();
            self.next_image.set((image_index + 1) % self.images as u32);
            Ok(AcquireStatus::Acquired { image_index, suboptimal: false })
        }

        fn wait_for_fence(&self, frame: usize) -> VulkanResult<()> {
            self.log(Event::WaitFence(frame));
            Ok(())
        }

        fn reset_fence(&self, frame: usize) -> VulkanResult<()> {
            self.log(Event::ResetFence(frame));
            self.signaled.borrow_mut()[frame] = false;
            Ok(())
        }

        fn submit(&self, frame: usize, _command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
            self.log(Event::Submit(frame));
            let failing = &self.script.failing_submits;
            if failing.get() > 0 {
                failing.set(failing.get() - 1);
                return Err(VulkanError::Api(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
            self.signaled.borrow_mut()[frame] = true;
            Ok(())
        }

        fn skip_frame(&self, frame: usize) -> VulkanResult<()> {
            self.log(Event::Skip(frame));
            self.signaled.borrow_mut()[frame] = true;
            Ok(())
        }

        fn present(&self, frame: usize, image_index: u32) -> VulkanResult<PresentStatus> {
            self.log(Event::Present(frame, image_index));
            Ok(self.script.presents.borrow_mut().pop_front().unwrap_or(PresentStatus::Optimal))
        }

        fn wait_idle(&self) -> VulkanResult<()> {
            self.log(Event::WaitIdle);
            Ok(())
        }

        fn rebuild(self, extent: vk::Extent2D) -> VulkanResult<Self> {
            self.log(Event::Rebuild);
            let script = Rc::clone(&self.script);
            let (frames, images) = (self.frames, self.images);
            drop(self);
            let mut rebuilt = Self::new(&script, frames, images);
            rebuilt.extent = extent;
            Ok(rebuilt)
        }
    }

    fn extent() -> vk::Extent2D {
        vk::Extent2D { width: 1024, height: 768 }
    }

    fn run_frame(frames: &mut FrameLoop<MockTarget>) -> bool {
        match frames.begin_frame(extent).unwrap() {
            Some(_) => {
                frames.end_frame(vk::CommandBuffer::null(), false, extent).unwrap();
                true
            }
            None => false,
        }
    }

    #[test]
    fn test_frame_slots_round_robin() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 3, 4));

        let mut observed = Vec::new();
        for _ in 0..10 {
            observed.push(frames.scheduler().current_frame());
            assert!(run_frame(&mut frames));
        }
        assert_eq!(observed, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_fence_reset_immediately_before_submit() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));
        for _ in 0..6 {
            assert!(run_frame(&mut frames));
        }

        let events = script.events.borrow();
        let submits: Vec<usize> = events
            .iter()
            .enumerate()
            .filter_map(|(i, event)| matches!(event, Event::Submit(_)).then_some(i))
            .collect();
        assert_eq!(submits.len(), 6);
        for i in submits {
            let Event::Submit(frame) = events[i] else { unreachable!() };
            assert_eq!(events[i - 1], Event::ResetFence(frame));
        }
    }

    #[test]
    fn test_acquire_waits_all_fences_first() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));
        assert!(run_frame(&mut frames));

        let events = script.events.borrow();
        assert_eq!(events[0], Event::WaitAll);
        assert_eq!(events[1], Event::Acquire(0));
    }

    #[test]
    fn test_reused_image_waits_on_owning_slot() {
        let script = Rc::new(Script::default());
        // Three images, two slots: image 0 comes back while slot 1 is current.
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));
        for _ in 0..3 {
            assert!(run_frame(&mut frames));
        }
        assert!(!script.events.borrow().iter().any(|e| matches!(e, Event::WaitFence(_))));
        assert_eq!(frames.scheduler().image_owner(0), Some(0));
        assert_eq!(frames.scheduler().image_owner(2), Some(0));

        script.events.borrow_mut().clear();
        assert!(run_frame(&mut frames));
        let events = script.events.borrow();
        assert_eq!(
            *events,
            vec![
                Event::WaitAll,
                Event::Acquire(1),
                Event::WaitFence(0),
                Event::ResetFence(1),
                Event::Submit(1),
                Event::Present(1, 0),
            ]
        );
        assert_eq!(frames.scheduler().image_owner(0), Some(1));
    }

    #[test]
    fn test_out_of_date_acquire_recreates_once() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));
        assert!(run_frame(&mut frames));

        script.acquires.borrow_mut().push_back(AcquireStatus::OutOfDate);
        assert!(!run_frame(&mut frames));

        // Old target's two slots torn down exactly once.
        assert_eq!(script.sync_destroyed.get(), 2);
        assert_eq!(frames.generation(), 1);
        let target = frames.target().unwrap();
        assert_eq!(target.frames_in_flight(), 2);
        assert_eq!(target.extent(), extent());
        assert_eq!(frames.scheduler().current_frame(), 0);
        assert_eq!(frames.scheduler().image_owner(0), None);

        let events = script.events.borrow().clone();
        let tail = &events[events.len() - 4..];
        assert_eq!(tail, &[Event::WaitAll, Event::Acquire(1), Event::WaitIdle, Event::Rebuild]);

        assert!(run_frame(&mut frames));
        assert_eq!(script.sync_destroyed.get(), 2);
    }

    #[test]
    fn test_suboptimal_acquire_still_renders() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 2));
        script
            .acquires
            .borrow_mut()
            .push_back(AcquireStatus::Acquired { image_index: 1, suboptimal: true });

        assert_eq!(frames.begin_frame(extent).unwrap(), Some(1));
        assert!(!frames.end_frame(vk::CommandBuffer::null(), false, extent).unwrap());
        assert_eq!(frames.generation(), 0);
    }

    #[test]
    fn test_present_status_and_resize_trigger_recreation() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));

        script.presents.borrow_mut().push_back(PresentStatus::Suboptimal);
        frames.begin_frame(extent).unwrap();
        assert!(frames.end_frame(vk::CommandBuffer::null(), false, extent).unwrap());
        assert_eq!(frames.generation(), 1);

        frames.begin_frame(extent).unwrap();
        assert!(frames.end_frame(vk::CommandBuffer::null(), true, extent).unwrap());
        assert_eq!(frames.generation(), 2);

        frames.begin_frame(extent).unwrap();
        assert!(!frames.end_frame(vk::CommandBuffer::null(), false, extent).unwrap());
        assert_eq!(frames.generation(), 2);
    }

    #[test]
    fn test_submit_without_acquire_is_rejected() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));
        let result = frames.end_frame(vk::CommandBuffer::null(), false, extent);
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
        assert!(script.events.borrow().is_empty());
    }

    #[test]
    fn test_out_of_range_image_is_rejected() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));
        script
            .acquires
            .borrow_mut()
            .push_back(AcquireStatus::Acquired { image_index: 7, suboptimal: false });
        assert!(frames.begin_frame(extent).is_err());
    }

    #[test]
    fn test_failed_submit_leaves_fence_signaled() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));
        assert!(run_frame(&mut frames));

        script.failing_submits.set(1);
        assert_eq!(frames.begin_frame(extent).unwrap(), Some(1));
        let result = frames.end_frame(vk::CommandBuffer::null(), false, extent);
        assert!(matches!(result, Err(VulkanError::Api(_))));
        assert!(frames.scheduler().has_abandoned_image());
        assert_eq!(frames.scheduler().image_owner(1), None);
        assert!(frames.target().unwrap().signaled.borrow().iter().all(|&signaled| signaled));

        let events = script.events.borrow().clone();
        assert_eq!(&events[events.len() - 3..], &[Event::ResetFence(1), Event::Submit(1), Event::Skip(1)]);

        // The abandoned image forces one rebuild, then frames flow again.
        assert!(!run_frame(&mut frames));
        assert_eq!(frames.generation(), 1);
        assert!(!frames.scheduler().has_abandoned_image());
        for _ in 0..3 {
            assert!(run_frame(&mut frames));
        }
    }

    #[test]
    fn test_abandoned_frame_skips_slot() {
        let script = Rc::new(Script::default());
        let mut frames = FrameLoop::new(MockTarget::new(&script, 2, 3));
        assert_eq!(frames.begin_frame(extent).unwrap(), Some(0));

        frames.abandon_frame();
        assert_eq!(frames.scheduler().acquired_image(), None);
        assert_eq!(script.events.borrow().last(), Some(&Event::Skip(0)));

        // Nothing acquired: a second abandon is a no-op.
        frames.abandon_frame();
        assert_eq!(script.events.borrow().iter().filter(|e| matches!(e, Event::Skip(_))).count(), 1);

        assert!(!run_frame(&mut frames));
        assert!(run_frame(&mut frames));
    }

    #[test]
    fn test_present_status_needs_recreation() {
        assert!(!PresentStatus::Optimal.needs_recreation());
        assert!(PresentStatus::Suboptimal.needs_recreation());
        assert!(PresentStatus::OutOfDate.needs_recreation());
    }
}
