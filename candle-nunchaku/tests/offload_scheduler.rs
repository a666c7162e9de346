//! Ordering and residency properties of the layer-offload scheduler.

use std::cell::RefCell;

use candle_nunchaku::context::ExecutionContext;
use candle_nunchaku::offload::{LayerOffloadScheduler, SchedulerStats};
use candle_nunchaku::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Load(usize),
    Compute(usize),
    Unload(usize),
}
use Event::*;

fn record(offload: bool, num_layers: usize) -> Result<(Vec<Event>, SchedulerStats)> {
    let log = RefCell::new(Vec::new());
    let mut ctx = ExecutionContext::host();
    let stats = LayerOffloadScheduler::new(offload, num_layers).run_with(
        &mut ctx,
        |layer| {
            log.borrow_mut().push(Compute(layer));
            Ok(())
        },
        |layer| {
            log.borrow_mut().push(Load(layer));
            Ok(())
        },
        |layer| {
            log.borrow_mut().push(Unload(layer));
            Ok(())
        },
    )?;
    Ok((log.into_inner(), stats))
}

#[test]
fn five_layers_with_lookahead() -> Result<()> {
    let (events, stats) = record(true, 5)?;
    assert_eq!(
        events,
        [
            Load(0),
            Load(1),
            Compute(0),
            Load(2),
            Compute(1),
            Unload(1),
            Load(3),
            Compute(2),
            Unload(2),
            Load(4),
            Compute(3),
            Unload(3),
            Compute(4),
            Unload(4),
        ]
    );
    assert_eq!(
        stats,
        SchedulerStats {
            computed: 5,
            loads: 5,
            unloads: 4,
            peak_resident: 2,
        }
    );
    Ok(())
}

#[test]
fn disabled_offload_only_computes() -> Result<()> {
    let (events, stats) = record(false, 5)?;
    assert_eq!(events, (0..5).map(Compute).collect::<Vec<_>>());
    assert_eq!(stats.loads + stats.unloads, 0);
    Ok(())
}

#[test]
fn every_compute_sees_its_layer_resident() -> Result<()> {
    for num_layers in 1..9 {
        let (events, _) = record(true, num_layers)?;
        let mut resident = vec![false; num_layers];
        let mut next = 0;
        for event in events {
            match event {
                Load(l) => resident[l] = true,
                Unload(l) => resident[l] = false,
                Compute(l) => {
                    assert_eq!(l, next, "computes run once, in order");
                    assert!(resident[l], "layer {l} computed while released");
                    next += 1;
                }
            }
            let streamed = resident.iter().skip(1).filter(|r| **r).count();
            assert!(streamed <= 2, "{streamed} streamed layers resident");
        }
        assert_eq!(next, num_layers);
        assert!(resident[0], "first layer stays pinned");
        assert!(resident.iter().skip(1).all(|r| !r));
    }
    Ok(())
}

#[test]
fn empty_model_does_nothing() -> Result<()> {
    let (events, stats) = record(true, 0)?;
    assert!(events.is_empty());
    assert_eq!(stats, SchedulerStats::default());
    Ok(())
}
