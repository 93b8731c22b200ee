//! Rule evaluation at interception points.
//!
//! The injector holds the scenario's rules partitioned by point so each
//! consultation only walks that point's rules. The first rule whose trigger
//! fires wins; remaining rules are skipped for that interception.

use agent_chaos_contract::{ChaosError, ChaosPoint, ChaosRule, Fault, TriggerCx};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Mutex;

/// Run-state snapshot a consultation is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConsultProbe<'a> {
    pub turn_index: usize,
    pub call_in_turn: usize,
    pub call_in_run: usize,
    pub tool_name: Option<&'a str>,
}

/// Decision to apply one fault at one interception.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub fault: Fault,
    pub point: ChaosPoint,
    /// Fingerprint of the origin rule, e.g. `LLM#0:rate_limit`.
    pub fingerprint: String,
}

/// Evaluates the declared rule set at each interception point.
pub struct Injector {
    rules: HashMap<ChaosPoint, Vec<IndexedRule>>,
    rng: Mutex<StdRng>,
}

struct IndexedRule {
    /// Declaration index within the scenario, used for fingerprints.
    index: usize,
    rule: ChaosRule,
}

impl Injector {
    /// Partition `rules` by point, preserving declaration order within each
    /// point, and seed the random source for probabilistic triggers.
    pub fn new(rules: Vec<ChaosRule>, seed: Option<u64>) -> Self {
        let mut partitioned: HashMap<ChaosPoint, Vec<IndexedRule>> = HashMap::new();
        for (index, rule) in rules.into_iter().enumerate() {
            partitioned
                .entry(rule.point())
                .or_default()
                .push(IndexedRule { index, rule });
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rules: partitioned,
            rng: Mutex::new(rng),
        }
    }

    /// An injector with no rules; used for baseline runs.
    pub fn empty(seed: Option<u64>) -> Self {
        Self::new(Vec::new(), seed)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Evaluate `point`'s rules against the probe. Returns the first firing
    /// verdict, or `None` when no trigger fires.
    ///
    /// A factory that produces a fault foreign to the rule's point is a
    /// fatal scenario error.
    pub fn consult(
        &self,
        point: ChaosPoint,
        probe: ConsultProbe<'_>,
    ) -> Result<Option<Verdict>, ChaosError> {
        let Some(rules) = self.rules.get(&point) else {
            return Ok(None);
        };
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| ChaosError::scenario("injector random source poisoned"))?;

        for indexed in rules {
            let mut cx = TriggerCx {
                turn_index: probe.turn_index,
                call_in_turn: probe.call_in_turn,
                call_in_run: probe.call_in_run,
                tool_name: probe.tool_name,
                rng: &mut rng,
            };
            if !indexed.rule.trigger().fires(&mut cx) {
                continue;
            }
            let fault = indexed.rule.build_fault();
            if fault.point() != point {
                return Err(ChaosError::FaultPointMismatch {
                    point,
                    fault: fault.label().to_string(),
                });
            }
            let fingerprint = format!("{}#{}:{}", point.label(), indexed.index, fault.label());
            return Ok(Some(Verdict {
                fault,
                point,
                fingerprint,
            }));
        }
        Ok(None)
    }
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("rules", &self.rule_count())
            .finish_non_exhaustive()
    }
}
