// Frame pacing - fences and semaphores for frames in flight
//
// Each slot owns an acquire semaphore, a render-finished semaphore and a
// fence that is signaled whenever the slot's last submission is done.
// `drive_frame` fixes the order of the per-frame calls so the fence always
// gets a submission after it is reset.

use ash::vk;
use anyhow::Result;
use super::VulkanDevice;

/// Sync objects of one frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Signaled so the first wait on a fresh slot returns at once
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        let device = &device.device;
        let image_available = unsafe { device.create_semaphore(&semaphore_info, None)? };
        let sync = Self {
            image_available,
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
        };
        // Partially built slots are cleaned up by `destroy` on the error path
        let render_finished = match unsafe { device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => semaphore,
            Err(e) => {
                sync.destroy(device);
                return Err(e.into());
            }
        };
        let sync = Self { render_finished, ..sync };
        match unsafe { device.create_fence(&fence_info, None) } {
            Ok(in_flight_fence) => Ok(Self { in_flight_fence, ..sync }),
            Err(e) => {
                sync.destroy(device);
                Err(e.into())
            }
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Round-robin over the slots of `graphics.max_frames_in_flight`
pub struct FramesInFlight {
    slots: Vec<FrameSync>,
    current: usize,
}

impl FramesInFlight {
    /// At least one slot, even if `count` is zero
    pub fn new(device: &VulkanDevice, count: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(count.max(1));
        for _ in 0..count.max(1) {
            match FrameSync::new(device) {
                Ok(sync) => slots.push(sync),
                Err(e) => {
                    for sync in &slots {
                        sync.destroy(&device.device);
                    }
                    return Err(e);
                }
            }
        }
        log::debug!("{} frames in flight", slots.len());
        Ok(Self { slots, current: 0 })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &FrameSync {
        &self.slots[self.current]
    }

    pub fn advance(&mut self) {
        self.current = next_slot(self.current, self.slots.len());
    }

    pub fn destroy(&self, device: &ash::Device) {
        for sync in &self.slots {
            sync.destroy(device);
        }
    }
}

fn next_slot(current: usize, count: usize) -> usize {
    (current + 1) % count.max(1)
}

/// How a frame ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Shown (or skipped), but the swapchain must be recreated
    Stale,
}

/// The GPU calls of one frame on one slot
pub trait FrameBackend {
    /// Block until the slot's previous submission is done
    fn wait_fence(&mut self) -> Result<()>;
    /// `None` when the swapchain is out of date; otherwise (index, suboptimal)
    fn acquire(&mut self) -> Result<Option<(u32, bool)>>;
    fn record(&mut self, image_index: u32) -> Result<()>;
    fn reset_fence(&mut self) -> Result<()>;
    /// Submit the recorded commands, waiting on the acquire semaphore and
    /// signaling the fence. With `with_commands` false only the wait and the
    /// signal are submitted.
    fn submit(&mut self, with_commands: bool) -> Result<()>;
    /// True when the swapchain should be recreated
    fn present(&mut self, image_index: u32) -> Result<bool>;
}

/// Run one frame. The fence is reset only right before a submission that
/// will signal it, so the next wait on this slot never hangs. A failed
/// recording still submits an empty batch that consumes the acquire
/// semaphore, then returns the error.
pub fn drive_frame<B: FrameBackend>(backend: &mut B) -> Result<FrameStatus> {
    backend.wait_fence()?;

    let Some((image_index, suboptimal)) = backend.acquire()? else {
        // Fence stays signaled, nothing was submitted
        return Ok(FrameStatus::Stale);
    };

    if let Err(e) = backend.record(image_index) {
        backend.reset_fence()?;
        backend.submit(false)?;
        return Err(e);
    }

    backend.reset_fence()?;
    backend.submit(true)?;
    let stale = backend.present(image_index)?;

    Ok(if suboptimal || stale {
        FrameStatus::Stale
    } else {
        FrameStatus::Presented
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the call order and models the fence and acquire semaphore
    #[derive(Default)]
    struct FakeFrame {
        calls: Vec<&'static str>,
        out_of_date: bool,
        suboptimal: bool,
        fail_record: bool,
        fence_pending: bool,
        semaphore_signaled: bool,
    }

    impl FrameBackend for FakeFrame {
        fn wait_fence(&mut self) -> Result<()> {
            self.calls.push("wait");
            // An unsignaled fence with nothing submitted would block forever
            anyhow::ensure!(!self.fence_pending, "waiting on a fence nothing will signal");
            Ok(())
        }

        fn acquire(&mut self) -> Result<Option<(u32, bool)>> {
            self.calls.push("acquire");
            if self.out_of_date {
                return Ok(None);
            }
            anyhow::ensure!(!self.semaphore_signaled, "acquire semaphore still signaled");
            self.semaphore_signaled = true;
            Ok(Some((2, self.suboptimal)))
        }

        fn record(&mut self, _image_index: u32) -> Result<()> {
            self.calls.push("record");
            if self.fail_record {
                anyhow::bail!("pipeline build failed");
            }
            Ok(())
        }

        fn reset_fence(&mut self) -> Result<()> {
            self.calls.push("reset");
            self.fence_pending = true;
            Ok(())
        }

        fn submit(&mut self, with_commands: bool) -> Result<()> {
            self.calls.push(if with_commands { "submit" } else { "submit-empty" });
            self.semaphore_signaled = false;
            self.fence_pending = false;
            Ok(())
        }

        fn present(&mut self, image_index: u32) -> Result<bool> {
            assert_eq!(image_index, 2);
            self.calls.push("present");
            Ok(false)
        }
    }

    #[test]
    fn test_frame_resets_fence_right_before_submit() {
        let mut frame = FakeFrame::default();
        assert_eq!(drive_frame(&mut frame).unwrap(), FrameStatus::Presented);
        assert_eq!(frame.calls, ["wait", "acquire", "record", "reset", "submit", "present"]);
    }

    #[test]
    fn test_failed_record_leaves_slot_usable() {
        let mut frame = FakeFrame {
            fail_record: true,
            ..Default::default()
        };
        assert!(drive_frame(&mut frame).is_err());
        assert_eq!(frame.calls, ["wait", "acquire", "record", "reset", "submit-empty"]);

        // The same slot runs again without hanging or reusing a signaled semaphore
        frame.fail_record = false;
        frame.calls.clear();
        assert_eq!(drive_frame(&mut frame).unwrap(), FrameStatus::Presented);
    }

    #[test]
    fn test_out_of_date_skips_everything_after_acquire() {
        let mut frame = FakeFrame {
            out_of_date: true,
            ..Default::default()
        };
        assert_eq!(drive_frame(&mut frame).unwrap(), FrameStatus::Stale);
        assert_eq!(frame.calls, ["wait", "acquire"]);
        assert!(!frame.fence_pending);
    }

    #[test]
    fn test_suboptimal_frame_is_presented_but_stale() {
        let mut frame = FakeFrame {
            suboptimal: true,
            ..Default::default()
        };
        assert_eq!(drive_frame(&mut frame).unwrap(), FrameStatus::Stale);
        assert_eq!(frame.calls.last(), Some(&"present"));
    }

    #[test]
    fn test_slots_wrap_around() {
        assert_eq!(next_slot(0, 2), 1);
        assert_eq!(next_slot(1, 2), 0);
        assert_eq!(next_slot(0, 1), 0);
        assert_eq!(next_slot(0, 0), 0);
    }
}
