use crate::error::Result;
use crate::graph::Graph;

use super::context::OptimizeContext;
use super::passes::{
    AssignBackendsPass, ConversionCanonicalizationPass, DebugInsertionPass,
    LayoutNegotiationPass, MemoryViewPlanningPass, PartitionPass, PermuteCanonicalizationPass,
    ReduceFp32ToFp16Pass, ReshapeCanonicalizationPass,
};

/// Statistics a [`GraphPass`] reports for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// The graph handed to the pass was modified and must be kept.
    pub changed: bool,
    pub iterations: usize,
    pub rewrites_applied: usize,
    pub inserted_layers: usize,
    pub erased_layers: usize,
}

impl PassResult {
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            inserted_layers: self.inserted_layers + other.inserted_layers,
            erased_layers: self.erased_layers + other.erased_layers,
        }
    }
}

/// A graph rewrite. A failing pass leaves the graph it was given untouched.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext<'_>) -> Result<PassResult>;
}

/// Passes swept together until a sweep applies no rewrite, at most `max_sweeps` times.
struct Stage {
    passes: Vec<Box<dyn GraphPass>>,
    max_sweeps: usize,
}

impl Stage {
    fn once(pass: impl GraphPass + 'static) -> Self {
        Self {
            passes: vec![Box::new(pass)],
            max_sweeps: 1,
        }
    }
}

/// The optimizer's ordered stages for one set of options.
pub struct PipelineOptimizer {
    stages: Vec<Stage>,
    log_stats: bool,
}

impl PipelineOptimizer {
    pub fn new(cx: &OptimizeContext<'_>) -> Self {
        let options = cx.options();
        let mut stages = Vec::new();

        if options.reduce_fp32_to_fp16 {
            stages.push(Stage::once(ReduceFp32ToFp16Pass));
        }
        stages.push(Stage::once(AssignBackendsPass));
        stages.push(Stage::once(LayoutNegotiationPass));
        stages.push(Stage {
            passes: vec![
                Box::new(PermuteCanonicalizationPass),
                Box::new(ReshapeCanonicalizationPass),
                Box::new(ConversionCanonicalizationPass),
            ],
            max_sweeps: options
                .canonicalize_max_iters
                .unwrap_or_else(crate::env::canonicalize_iters)
                .max(1),
        });
        stages.push(Stage::once(MemoryViewPlanningPass));
        stages.push(Stage::once(PartitionPass));
        // Taps go in last so synthetic layers are observed too.
        if options.debug {
            stages.push(Stage::once(DebugInsertionPass {
                to_file: options.debug_to_file,
            }));
        }

        Self {
            stages,
            log_stats: crate::env::pass_stats_enabled(),
        }
    }

    pub fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
        let mut totals = PassResult::default();
        for stage in &self.stages {
            for sweep in 1..=stage.max_sweeps {
                let mut rewrites = 0;
                for pass in &stage.passes {
                    let stats = self.run_pass(pass.as_ref(), graph, cx)?;
                    rewrites += stats.rewrites_applied;
                    totals = totals.merge(stats);
                }
                if rewrites == 0 {
                    break;
                }
                if sweep == stage.max_sweeps && stage.max_sweeps > 1 {
                    tracing::debug!(sweeps = sweep, "stage stopped before reaching a fixed point");
                }
            }
        }
        Ok(totals)
    }

    /// Runs `pass` on a copy of `graph` and keeps the copy only if the pass changed it.
    fn run_pass(
        &self,
        pass: &dyn GraphPass,
        graph: &mut Graph,
        cx: &mut OptimizeContext<'_>,
    ) -> Result<PassResult> {
        let _span = tracing::debug_span!("pass", name = pass.name()).entered();
        let mut scratch = graph.clone();
        let stats = pass.run(&mut scratch, cx)?;
        if stats.changed {
            *graph = scratch;
        }
        if self.log_stats {
            tracing::info!(
                pass = pass.name(),
                changed = stats.changed,
                rewrites = stats.rewrites_applied,
                inserted = stats.inserted_layers,
                erased = stats.erased_layers,
                layers = graph.num_layers(),
                "optimizer pass stats"
            );
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::BackendRegistry;
    use crate::optimizer::OptimizerOptions;

    /// Reports one rewrite per run until `pending` runs out.
    struct Countdown {
        pending: AtomicUsize,
        runs: AtomicUsize,
    }

    impl Countdown {
        fn new(pending: usize) -> Self {
            Self {
                pending: AtomicUsize::new(pending),
                runs: AtomicUsize::new(0),
            }
        }
    }

    impl GraphPass for &Countdown {
        fn name(&self) -> &'static str {
            "countdown"
        }

        fn run(&self, _graph: &mut Graph, _cx: &mut OptimizeContext<'_>) -> Result<PassResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let rewrites = match self.pending.load(Ordering::SeqCst) {
                0 => 0,
                left => {
                    self.pending.store(left - 1, Ordering::SeqCst);
                    1
                }
            };
            Ok(PassResult {
                changed: rewrites > 0,
                iterations: 1,
                rewrites_applied: rewrites,
                ..PassResult::default()
            })
        }
    }

    fn sweep(pass: &'static Countdown, max_sweeps: usize) -> PassResult {
        let registry = BackendRegistry::new();
        let options = OptimizerOptions::default();
        let mut cx = OptimizeContext::bare(&registry, &options);
        let optimizer = PipelineOptimizer {
            stages: vec![Stage {
                passes: vec![Box::new(pass)],
                max_sweeps,
            }],
            log_stats: false,
        };
        optimizer.run(&mut Graph::new(), &mut cx).unwrap()
    }

    #[test]
    fn stage_stops_after_a_sweep_without_rewrites() {
        let pass: &'static Countdown = Box::leak(Box::new(Countdown::new(3)));
        let totals = sweep(pass, 10);
        assert_eq!(pass.runs.load(Ordering::SeqCst), 4);
        assert_eq!(totals.rewrites_applied, 3);
        assert_eq!(totals.iterations, 4);
    }

    #[test]
    fn stage_sweeps_are_bounded() {
        let pass: &'static Countdown = Box::leak(Box::new(Countdown::new(100)));
        let totals = sweep(pass, 5);
        assert_eq!(pass.runs.load(Ordering::SeqCst), 5);
        assert_eq!(totals.rewrites_applied, 5);
    }
}
