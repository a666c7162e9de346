//! Per-layer parameter streaming.
//!
//! The scheduler drives three callbacks per layer. With offload disabled it
//! only computes, in order. With offload enabled the first layer is loaded
//! up front and stays pinned; every other layer is loaded one step ahead of
//! its compute and unloaded right after it, so at most two streamed layers
//! are resident at once:
//!
//! ```text
//! load(0)
//! load(1)  compute(0)
//! load(2)  compute(1)  unload(1)
//! ...
//!          compute(N-1) unload(N-1)
//! ```
//!
//! Loads and unloads run under the transfer stream, computes under the
//! compute stream.

use crate::context::{ExecutionContext, StreamId};
use crate::error::Result;

/// Per-layer callbacks driven by [`LayerOffloadScheduler`].
pub trait LayerOps {
    fn compute(&mut self, ctx: &mut ExecutionContext, layer: usize) -> Result<()>;
    fn load(&mut self, ctx: &mut ExecutionContext, layer: usize) -> Result<()>;
    fn unload(&mut self, ctx: &mut ExecutionContext, layer: usize) -> Result<()>;
}

/// Adapts three closures to [`LayerOps`].
pub struct FnOps<C, L, U> {
    pub compute: C,
    pub load: L,
    pub unload: U,
}

impl<C, L, U> LayerOps for FnOps<C, L, U>
where
    C: FnMut(usize) -> Result<()>,
    L: FnMut(usize) -> Result<()>,
    U: FnMut(usize) -> Result<()>,
{
    fn compute(&mut self, _ctx: &mut ExecutionContext, layer: usize) -> Result<()> {
        (self.compute)(layer)
    }

    fn load(&mut self, _ctx: &mut ExecutionContext, layer: usize) -> Result<()> {
        (self.load)(layer)
    }

    fn unload(&mut self, _ctx: &mut ExecutionContext, layer: usize) -> Result<()> {
        (self.unload)(layer)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub computed: usize,
    pub loads: usize,
    pub unloads: usize,
    /// Largest number of streamed (non-pinned) layers resident at once.
    pub peak_resident: usize,
}

#[derive(Debug, Clone)]
pub struct LayerOffloadScheduler {
    offload: bool,
    num_layers: usize,
    pinned_first: bool,
    compute_stream: StreamId,
    transfer_stream: StreamId,
}

#[derive(Default)]
struct Streamed {
    count: usize,
}

impl LayerOffloadScheduler {
    pub fn new(offload: bool, num_layers: usize) -> Self {
        Self {
            offload,
            num_layers,
            pinned_first: true,
            compute_stream: StreamId::COMPUTE,
            transfer_stream: StreamId::TRANSFER,
        }
    }

    /// Whether layer 0 stays resident between passes (default: true).
    pub fn with_pinned_first(mut self, pinned: bool) -> Self {
        self.pinned_first = pinned;
        self
    }

    pub fn with_streams(mut self, compute: StreamId, transfer: StreamId) -> Self {
        self.compute_stream = compute;
        self.transfer_stream = transfer;
        self
    }

    pub fn offload(&self) -> bool {
        self.offload
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn is_pinned(&self, layer: usize) -> bool {
        self.pinned_first && layer == 0
    }

    fn load<O: LayerOps>(
        &self,
        ctx: &mut ExecutionContext,
        ops: &mut O,
        layer: usize,
        stats: &mut SchedulerStats,
        streamed: &mut Streamed,
    ) -> Result<()> {
        tracing::trace!(layer, "load");
        {
            let mut stream = ctx.enter_stream(self.transfer_stream);
            ops.load(&mut stream, layer)?;
        }
        stats.loads += 1;
        if !self.is_pinned(layer) {
            streamed.count += 1;
            stats.peak_resident = stats.peak_resident.max(streamed.count);
        }
        Ok(())
    }

    fn unload<O: LayerOps>(
        &self,
        ctx: &mut ExecutionContext,
        ops: &mut O,
        layer: usize,
        stats: &mut SchedulerStats,
        streamed: &mut Streamed,
    ) -> Result<()> {
        tracing::trace!(layer, "unload");
        {
            let mut stream = ctx.enter_stream(self.transfer_stream);
            ops.unload(&mut stream, layer)?;
        }
        stats.unloads += 1;
        streamed.count = streamed.count.saturating_sub(1);
        Ok(())
    }

    fn compute<O: LayerOps>(
        &self,
        ctx: &mut ExecutionContext,
        ops: &mut O,
        layer: usize,
        stats: &mut SchedulerStats,
    ) -> Result<()> {
        tracing::trace!(layer, "compute");
        let mut stream = ctx.enter_stream(self.compute_stream);
        ops.compute(&mut stream, layer)?;
        stats.computed += 1;
        Ok(())
    }

    /// Runs every layer once, in order.
    pub fn run<O: LayerOps>(&self, ctx: &mut ExecutionContext, ops: &mut O) -> Result<SchedulerStats> {
        let mut stats = SchedulerStats::default();
        if !self.offload {
            for layer in 0..self.num_layers {
                self.compute(ctx, ops, layer, &mut stats)?;
            }
            return Ok(stats);
        }
        if self.num_layers == 0 {
            return Ok(stats);
        }
        let mut streamed = Streamed::default();
        self.load(ctx, ops, 0, &mut stats, &mut streamed)?;
        for layer in 0..self.num_layers {
            if layer + 1 < self.num_layers {
                self.load(ctx, ops, layer + 1, &mut stats, &mut streamed)?;
            }
            self.compute(ctx, ops, layer, &mut stats)?;
            if !self.is_pinned(layer) {
                self.unload(ctx, ops, layer, &mut stats, &mut streamed)?;
            }
        }
        Ok(stats)
    }

    /// [`Self::run`] with plain closures that do not need the context.
    pub fn run_with<C, L, U>(
        &self,
        ctx: &mut ExecutionContext,
        compute: C,
        load: L,
        unload: U,
    ) -> Result<SchedulerStats>
    where
        C: FnMut(usize) -> Result<()>,
        L: FnMut(usize) -> Result<()>,
        U: FnMut(usize) -> Result<()>,
    {
        self.run(
            ctx,
            &mut FnOps {
                compute,
                load,
                unload,
            },
        )
    }
}
