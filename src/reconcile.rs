//! Debounced reconciliation: signals reset a timer, and once it expires the rules are fetched,
//! compiled, and activated if they changed.

use log::{debug, error, info};
use std::io::{self, Write};
use std::time::Duration;
use tokio::{
    select,
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};

use crate::apply::{self, Activate};
use crate::compile::compile;
use crate::fetch::Fetch;
use crate::kube_watch::Signal;
use crate::render::render;
use crate::rules::{RuleSet, has_changed};


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Render,
    Apply(apply::Stage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Same rules as the active ones, nothing enforced.
    Unchanged,
    Applied,
    /// Rules changed and were printed only. Dry-run passes print the rules even when unchanged.
    DryRun,
    /// The active rules stay the previous ones.
    Failed(Stage),
}

pub struct Reconciler<F, A> {
    fetcher: F,
    activator: A,
    debounce: Duration,
    dry_run: bool,
    /// last activated rules
    baseline: Option<RuleSet>,
}

impl<F: Fetch, A: Activate> Reconciler<F, A> {
    pub fn new(fetcher: F, activator: A, debounce: Duration, dry_run: bool) -> Self {
        Self {
            fetcher,
            activator,
            debounce,
            dry_run,
            baseline: None,
        }
    }

    pub fn baseline(&self) -> Option<&RuleSet> {
        self.baseline.as_ref()
    }

    /// Runs until every signal sender is gone. Starts debouncing, so a first pass happens without
    /// any signal.
    pub async fn run(mut self, mut signals: mpsc::Receiver<Signal>) {
        let timer = time::sleep(self.debounce);
        tokio::pin!(timer);
        let mut debouncing = true;

        loop {
            select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        info!("no more signal sources");
                        return;
                    };
                    debug!("{signal} changed, waiting for the next quiet period");
                    timer.as_mut().reset(Instant::now() + self.debounce);
                    debouncing = true;
                }
                _ = &mut timer, if debouncing => {
                    debouncing = false;
                    let outcome = self.reconcile().await;
                    debug!("reconcile outcome: {outcome:?}");
                }
            }
        }
    }

    /// One fetch, compile, render, apply pass. The baseline only moves forward on success.
    pub async fn reconcile(&mut self) -> Outcome {
        let snapshot = match self.fetcher.fetch().await {
            Ok(v) => v,
            Err(e) => {
                error!("could not fetch k8s entities to build firewall rules: {e}");
                return Outcome::Failed(Stage::Fetch);
            }
        };

        if snapshot.is_empty() {
            debug!("no network policy nor exposed service");
        }

        let rules = compile(&snapshot);
        let changed = has_changed(self.baseline.as_ref(), &rules);

        if self.dry_run {
            // every pass shows the rules that would be enforced
            if let Err(e) = write_rules(&mut io::stdout().lock(), &rules) {
                error!("failed to print rules: {e}");
            }
            self.baseline = Some(rules);
            return if changed {
                Outcome::DryRun
            } else {
                Outcome::Unchanged
            };
        }

        if !changed {
            debug!(
                "firewall rules unchanged ({} ingress, {} egress)",
                rules.ingress.len(),
                rules.egress.len()
            );
            self.baseline = Some(rules);
            return Outcome::Unchanged;
        }

        info!(
            "new firewall rules to enforce: {} ingress, {} egress",
            rules.ingress.len(),
            rules.egress.len()
        );

        let document = match render(&rules) {
            Ok(v) => v,
            Err(e) => {
                error!("error rendering nftables rules: {e}");
                return Outcome::Failed(Stage::Render);
            }
        };

        debug!("nftables rules:\n{document}");

        if let Err(e) = self.activator.apply(&document).await {
            error!("{} failed, previous rules remain active: {e}", e.stage());
            return Outcome::Failed(Stage::Apply(e.stage()));
        }

        info!("applied new set of nftables rules (xxh3:{:032x})", rules.digest());
        self.baseline = Some(rules);
        Outcome::Applied
    }
}

fn write_rules(out: &mut impl Write, rules: &RuleSet) -> io::Result<()> {
    for (i, rule) in rules.ingress.iter().enumerate() {
        writeln!(out, "{} ingress: {rule}", i + 1)?;
    }
    for (i, rule) in rules.egress.iter().enumerate() {
        writeln!(out, "{} egress: {rule}", i + 1)?;
    }
    Ok(())
}

/// Periodic fallback signal, first sent one period after start.
pub async fn tick(period: Duration, tx: mpsc::Sender<Signal>) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if tx.send(Signal::Tick).await.is_err() {
            return;
        }
    }
}
