//! Explicit device and stream context.
//!
//! An [`ExecutionContext`] carries the stack of active device frames, the
//! stack of active streams and a cached device id. It is threaded by `&mut`
//! from the model through the offload scheduler into every layer callback,
//! so there is one context per host thread and no global state.
//!
//! Entering a frame returns a guard that derefs to the context. Dropping the
//! guard restores the device that was active when the frame was entered.
//! Because each guard mutably borrows its parent, frames can only be released
//! in stack order.
//!
//! Device-id cache rules:
//! - the cache is only consulted while the top frame has caching enabled,
//! - entering from outside any frame resets it,
//! - entering or leaving a frame with `disable_cache` resets it,
//! - leaving a frame resets it when the new top frame disables caching or
//!   when the stack becomes empty.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle::{Device, DeviceLocation};

use crate::error::{OpContext, Result};

/// Queries and switches the active accelerator of the calling thread.
pub trait DeviceRuntime: std::fmt::Debug {
    fn current_device(&self) -> candle::Result<usize>;
    fn set_device(&self, ordinal: usize) -> candle::Result<()>;
}

/// Bookkeeping runtime used when the tensors live on the host or when the
/// backend selects devices per tensor, as candle does.
#[derive(Debug, Default)]
pub struct HostRuntime {
    active: AtomicUsize,
}

impl DeviceRuntime for HostRuntime {
    fn current_device(&self) -> candle::Result<usize> {
        Ok(self.active.load(Ordering::Relaxed))
    }

    fn set_device(&self, ordinal: usize) -> candle::Result<()> {
        self.active.store(ordinal, Ordering::Relaxed);
        Ok(())
    }
}

/// Ordinal of the accelerator backing `device`, `None` for the host.
pub fn device_ordinal(device: &Device) -> Option<usize> {
    match device.location() {
        DeviceLocation::Cpu => None,
        DeviceLocation::Cuda { gpu_id } | DeviceLocation::Metal { gpu_id } => Some(gpu_id),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

impl StreamId {
    pub const DEFAULT: Self = Self(0);
    pub const COMPUTE: Self = Self(1);
    pub const TRANSFER: Self = Self(2);
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    last_device: usize,
    disable_cache: bool,
}

#[derive(Debug)]
pub struct ExecutionContext {
    runtime: Arc<dyn DeviceRuntime + Send + Sync>,
    frames: Vec<Frame>,
    streams: Vec<StreamId>,
    device_cache: Option<usize>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::host()
    }
}

impl ExecutionContext {
    pub fn new(runtime: Arc<dyn DeviceRuntime + Send + Sync>) -> Self {
        Self {
            runtime,
            frames: Vec::new(),
            streams: Vec::new(),
            device_cache: None,
        }
    }

    pub fn host() -> Self {
        Self::new(Arc::new(HostRuntime::default()))
    }

    fn cache_enabled(&self) -> bool {
        self.frames.last().is_some_and(|f| !f.disable_cache)
    }

    /// Number of device frames currently entered.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn cached_device(&self) -> Option<usize> {
        self.device_cache
    }

    pub fn current_stream(&self) -> StreamId {
        self.streams.last().copied().unwrap_or(StreamId::DEFAULT)
    }

    /// Active device id, served from the cache when the top frame allows it.
    pub fn device(&mut self) -> Result<usize> {
        if self.cache_enabled() {
            if let Some(idx) = self.device_cache {
                return Ok(idx);
            }
        }
        let idx = self.runtime.current_device().op("get_device")?;
        if self.cache_enabled() {
            self.device_cache = Some(idx);
        }
        Ok(idx)
    }

    fn switch_device(&mut self, idx: usize) -> Result<()> {
        if self.cache_enabled() && self.device_cache == Some(idx) {
            return Ok(());
        }
        self.runtime.set_device(idx).op("set_device")?;
        self.device_cache = self.cache_enabled().then_some(idx);
        Ok(())
    }

    /// Pushes a device frame, switching to `device` when one is given.
    ///
    /// Set `disable_cache` when the frame wraps code that may change the
    /// active device behind the context's back (weight transfers, foreign
    /// kernels).
    pub fn enter_device(
        &mut self,
        device: Option<usize>,
        disable_cache: bool,
    ) -> Result<DeviceGuard<'_>> {
        if self.frames.is_empty() || disable_cache {
            self.device_cache = None;
        }
        self.frames.push(Frame {
            last_device: 0,
            disable_cache,
        });
        let last_device = match self.device() {
            Ok(idx) => idx,
            Err(err) => {
                self.frames.pop();
                return Err(err);
            }
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.last_device = last_device;
        }
        if let Some(idx) = device {
            if let Err(err) = self.switch_device(idx) {
                self.frames.pop();
                return Err(err);
            }
        }
        let depth = self.frames.len();
        Ok(DeviceGuard { ctx: self, depth })
    }

    pub fn enter_stream(&mut self, stream: StreamId) -> StreamGuard<'_> {
        self.streams.push(stream);
        StreamGuard { ctx: self }
    }
}

/// Scoped device frame. Restores the previous device on drop.
#[derive(Debug)]
pub struct DeviceGuard<'a> {
    ctx: &'a mut ExecutionContext,
    depth: usize,
}

impl Deref for DeviceGuard<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        self.ctx
    }
}

impl DerefMut for DeviceGuard<'_> {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        self.ctx
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        let ctx = &mut *self.ctx;
        debug_assert_eq!(ctx.frames.len(), self.depth);
        let Some(frame) = ctx.frames.last().copied() else {
            return;
        };
        if frame.disable_cache {
            ctx.device_cache = None;
        }
        if let Err(err) = ctx.switch_device(frame.last_device) {
            tracing::error!(device = frame.last_device, %err, "failed to restore device");
        }
        ctx.frames.pop();
        if !ctx.cache_enabled() {
            ctx.device_cache = None;
        }
    }
}

/// Scoped stream selection. Pops the stream on drop.
#[derive(Debug)]
pub struct StreamGuard<'a> {
    ctx: &'a mut ExecutionContext,
}

impl Deref for StreamGuard<'_> {
    type Target = ExecutionContext;

    fn deref(&self) -> &ExecutionContext {
        self.ctx
    }
}

impl DerefMut for StreamGuard<'_> {
    fn deref_mut(&mut self) -> &mut ExecutionContext {
        self.ctx
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        self.ctx.streams.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct CountingRuntime {
        active: AtomicUsize,
        queries: AtomicUsize,
        switches: Mutex<Vec<usize>>,
    }

    impl DeviceRuntime for CountingRuntime {
        fn current_device(&self) -> candle::Result<usize> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            Ok(self.active.load(Ordering::Relaxed))
        }

        fn set_device(&self, ordinal: usize) -> candle::Result<()> {
            self.active.store(ordinal, Ordering::Relaxed);
            self.switches.lock().unwrap().push(ordinal);
            Ok(())
        }
    }

    fn counting() -> (Arc<CountingRuntime>, ExecutionContext) {
        let runtime = Arc::new(CountingRuntime::default());
        let ctx = ExecutionContext::new(runtime.clone());
        (runtime, ctx)
    }

    #[test]
    fn nested_frames_restore_devices() -> Result<()> {
        let (runtime, mut ctx) = counting();
        {
            let mut outer = ctx.enter_device(Some(1), false)?;
            assert_eq!(outer.device()?, 1);
            {
                let mut inner = outer.enter_device(Some(2), false)?;
                assert_eq!(inner.device()?, 2);
                assert_eq!(inner.depth(), 2);
            }
            assert_eq!(outer.device()?, 1);
        }
        assert_eq!(ctx.depth(), 0);
        assert_eq!(runtime.active.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.cached_device(), None);
        Ok(())
    }

    #[test]
    fn cached_device_avoids_queries() -> Result<()> {
        let (runtime, mut ctx) = counting();
        let mut guard = ctx.enter_device(None, false)?;
        let queries = runtime.queries.load(Ordering::Relaxed);
        for _ in 0..4 {
            assert_eq!(guard.device()?, 0);
        }
        assert_eq!(runtime.queries.load(Ordering::Relaxed), queries);
        Ok(())
    }

    #[test]
    fn disabled_cache_forces_fresh_queries() -> Result<()> {
        let (runtime, mut ctx) = counting();
        let mut outer = ctx.enter_device(Some(1), false)?;
        assert_eq!(outer.cached_device(), Some(1));
        {
            let mut inner = outer.enter_device(None, true)?;
            assert_eq!(inner.cached_device(), None);
            // Foreign code switches the device behind the context.
            runtime.active.store(3, Ordering::Relaxed);
            let before = runtime.queries.load(Ordering::Relaxed);
            assert_eq!(inner.device()?, 3);
            assert_eq!(inner.device()?, 3);
            assert_eq!(runtime.queries.load(Ordering::Relaxed), before + 2);
        }
        assert_eq!(runtime.active.load(Ordering::Relaxed), 1);
        assert_eq!(outer.device()?, 1);
        Ok(())
    }

    #[test]
    fn stream_guards_nest() {
        let mut ctx = ExecutionContext::host();
        assert_eq!(ctx.current_stream(), StreamId::DEFAULT);
        {
            let mut transfer = ctx.enter_stream(StreamId::TRANSFER);
            assert_eq!(transfer.current_stream(), StreamId::TRANSFER);
            let compute = transfer.enter_stream(StreamId::COMPUTE);
            assert_eq!(compute.current_stream(), StreamId::COMPUTE);
        }
        assert_eq!(ctx.current_stream(), StreamId::DEFAULT);
    }

    #[test]
    fn host_device_has_no_ordinal() {
        assert_eq!(device_ordinal(&Device::Cpu), None);
    }
}
