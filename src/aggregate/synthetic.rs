use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::{SyntheticConfig, SyntheticKind};
use crate::source::event::RawEvent;
use crate::source::filter::EventFilter;

use super::snapshot::MetricKey;

enum Calculator {
    Accumulation {
        increment: Option<EventFilter>,
        decrement: Option<EventFilter>,
    },
    Instance {
        filter: EventFilter,
        instance_id: Regex,
    },
    Highest {
        inner: Box<Calculator>,
        fade_out_ns: u64,
    },
}

impl Calculator {
    fn from_kind(kind: &SyntheticKind) -> Result<Self> {
        Ok(match kind {
            SyntheticKind::Accumulation {
                increment,
                decrement,
            } => Self::Accumulation {
                increment: increment
                    .as_ref()
                    .map(EventFilter::from_config)
                    .transpose()
                    .context("increment")?,
                decrement: decrement
                    .as_ref()
                    .map(EventFilter::from_config)
                    .transpose()
                    .context("decrement")?,
            },
            SyntheticKind::Instance {
                filter,
                instance_id,
            } => Self::Instance {
                filter: EventFilter::from_config(filter).context("filter")?,
                instance_id: Regex::new(instance_id)
                    .with_context(|| format!("compiling instance_id {instance_id:?}"))?,
            },
            SyntheticKind::Highest { fade_out, of } => Self::Highest {
                inner: Box::new(Self::from_kind(of)?),
                fade_out_ns: u64::try_from(fade_out.as_nanos()).unwrap_or(u64::MAX),
            },
        })
    }

    fn observe(&self, partial: &mut Partial, event: &RawEvent) {
        match self {
            Self::Accumulation {
                increment,
                decrement,
            } => {
                let value = event.sample_value();
                if increment
                    .as_ref()
                    .is_some_and(|f| f.matches(&event.name, &event.category))
                {
                    partial.total += value;
                    partial.seen = true;
                }
                if decrement
                    .as_ref()
                    .is_some_and(|f| f.matches(&event.name, &event.category))
                {
                    partial.total -= value;
                    partial.seen = true;
                }
            }
            Self::Instance {
                filter,
                instance_id,
            } => {
                if !filter.matches(&event.name, &event.category) {
                    return;
                }
                let Some(id) = instance_id
                    .captures(&event.name)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str())
                    .filter(|id| !id.is_empty())
                else {
                    return;
                };
                let value = event.sample_value();
                match partial.instances.get_mut(id) {
                    Some(total) => *total += value,
                    None => {
                        partial.instances.insert(id.to_string(), value);
                    }
                }
            }
            Self::Highest { inner, .. } => inner.observe(partial, event),
        }
    }

    /// Value of a non-`Highest` calculator for one window.
    fn window_value(&self, partial: Option<&Partial>) -> Option<f64> {
        let partial = partial?;
        match self {
            Self::Accumulation { .. } => partial.seen.then_some(partial.total),
            Self::Instance { .. } => partial.instances.values().copied().reduce(f64::max),
            Self::Highest { inner, .. } => inner.window_value(Some(partial)),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Partial {
    total: f64,
    seen: bool,
    instances: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Peak {
    value: f64,
    window_start_ns: u64,
}

struct Derived {
    key: MetricKey,
    calculator: Calculator,
}

/// Metrics derived per window from the events of other metrics.
///
/// Partial state is kept per open window and turned into samples when that
/// window is sealed. `Highest` peaks carry over from one sealed window to the
/// next and fade by event time, so they depend on windows sealing in order.
#[derive(Default)]
pub struct SyntheticSet {
    derived: Vec<Derived>,
    partials: HashMap<u64, Vec<Partial>>,
    peaks: Vec<Option<Peak>>,
}

impl SyntheticSet {
    pub fn from_config(cfgs: &[SyntheticConfig]) -> Result<Self> {
        let derived = cfgs
            .iter()
            .map(|cfg| {
                Ok(Derived {
                    key: MetricKey::new(cfg.name.as_str(), cfg.category.as_str()),
                    calculator: Calculator::from_kind(&cfg.kind)
                        .with_context(|| format!("synthetic metric {}", cfg.name))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            peaks: vec![None; derived.len()],
            derived,
            partials: HashMap::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.derived.is_empty()
    }

    /// Feeds one accepted event belonging to the window at `window_start_ns`.
    pub fn observe(&mut self, window_start_ns: u64, event: &RawEvent) {
        if self.derived.is_empty() {
            return;
        }
        let count = self.derived.len();
        let partials = self
            .partials
            .entry(window_start_ns)
            .or_insert_with(|| vec![Partial::default(); count]);
        for (derived, partial) in self.derived.iter().zip(partials.iter_mut()) {
            derived.calculator.observe(partial, event);
        }
    }

    /// Derived samples for a window being sealed. Consumes its partial state
    /// and advances the held peaks.
    pub fn finish(&mut self, window_start_ns: u64) -> Vec<(MetricKey, f64)> {
        if self.derived.is_empty() {
            return Vec::new();
        }
        let partials = self.partials.remove(&window_start_ns);
        let (samples, peaks) = self.evaluate(window_start_ns, partials.as_deref());
        self.peaks = peaks;
        samples
    }

    /// Derived samples for a window that stays open. Leaves all state untouched.
    pub fn preview(&self, window_start_ns: u64) -> Vec<(MetricKey, f64)> {
        if self.derived.is_empty() {
            return Vec::new();
        }
        let partials = self.partials.get(&window_start_ns);
        self.evaluate(window_start_ns, partials.map(Vec::as_slice)).0
    }

    fn evaluate(
        &self,
        window_start_ns: u64,
        partials: Option<&[Partial]>,
    ) -> (Vec<(MetricKey, f64)>, Vec<Option<Peak>>) {
        let mut samples = Vec::new();
        let mut peaks = self.peaks.clone();

        for (i, derived) in self.derived.iter().enumerate() {
            let partial = partials.and_then(|p| p.get(i));
            match &derived.calculator {
                Calculator::Highest { inner, fade_out_ns } => {
                    let peak = next_peak(
                        peaks[i],
                        inner.window_value(partial),
                        window_start_ns,
                        *fade_out_ns,
                    );
                    if let Some(peak) = peak {
                        samples.push((derived.key.clone(), peak.value));
                    }
                    peaks[i] = peak;
                }
                Calculator::Instance { .. } => {
                    let Some(partial) = partial else { continue };
                    if let Some(value) = derived.calculator.window_value(Some(partial)) {
                        samples.push((derived.key.clone(), value));
                    }
                    for (id, total) in &partial.instances {
                        let child: Arc<str> = format!("{}: {id}", derived.key.name).into();
                        samples.push((
                            MetricKey {
                                name: child,
                                category: Arc::clone(&derived.key.category),
                            },
                            *total,
                        ));
                    }
                }
                Calculator::Accumulation { .. } => {
                    if let Some(value) = derived.calculator.window_value(partial) {
                        samples.push((derived.key.clone(), value));
                    }
                }
            }
        }
        (samples, peaks)
    }
}

/// Peak after a window whose inner value is `value`. A higher value always
/// replaces the peak; once `fade_out_ns` has passed since the peak was set,
/// the current value replaces it, or the peak is forgotten when there is none.
fn next_peak(
    held: Option<Peak>,
    value: Option<f64>,
    window_start_ns: u64,
    fade_out_ns: u64,
) -> Option<Peak> {
    let faded = held.is_some_and(|p| window_start_ns.saturating_sub(p.window_start_ns) >= fade_out_ns);
    match (held, value) {
        (None, Some(value)) => Some(Peak {
            value,
            window_start_ns,
        }),
        (Some(peak), Some(value)) if value > peak.value || faded => Some(Peak {
            value,
            window_start_ns,
        }),
        (Some(_), None) if faded => None,
        (held, _) => held,
    }
}
