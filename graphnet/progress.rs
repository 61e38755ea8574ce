use crate::gridsearch::GridPoint;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Mutex;

/// Phases of a zoom grid search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GridProgressStage {
    Coarse,
    Zoom,
}

impl GridProgressStage {
    pub fn for_pass(pass: usize) -> Self {
        if pass == 0 { Self::Coarse } else { Self::Zoom }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Coarse => "coarse grid",
            Self::Zoom => "zoomed grid",
        }
    }
}

impl fmt::Display for GridProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting grid search progress. Points are evaluated on the
/// rayon pool, so callbacks take `&self` and may arrive from any thread.
pub trait GridProgressObserver: Sync {
    fn on_pass_start(&self, pass: usize, stage: GridProgressStage, total_points: usize) {
        let _ = (pass, stage, total_points);
    }
    fn on_point_finished(&self, pass: usize, point: &GridPoint) {
        let _ = (pass, point);
    }
    fn on_pass_finish(&self, pass: usize, best: Option<&GridPoint>) {
        let _ = (pass, best);
    }
}

#[derive(Default)]
pub struct NoopGridProgress;

impl GridProgressObserver for NoopGridProgress {}

/// Terminal progress bar, one per pass.
#[derive(Default)]
pub struct BarGridProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarGridProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Option<ProgressBar> {
        self.bar.lock().ok().and_then(|guard| guard.clone())
    }
}

impl GridProgressObserver for BarGridProgress {
    fn on_pass_start(&self, pass: usize, stage: GridProgressStage, total_points: usize) {
        let bar = ProgressBar::new(total_points as u64);
        let style = ProgressStyle::with_template(&format!(
            ">  - Pass {} ({stage}) [{{bar:40.cyan/blue}}] {{pos}}/{{len}} ({{eta}}) {{msg}}",
            pass + 1
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        if let Ok(mut guard) = self.bar.lock() {
            *guard = Some(bar);
        }
    }

    fn on_point_finished(&self, pass: usize, point: &GridPoint) {
        let _ = (pass, point);
        if let Some(bar) = self.current() {
            bar.inc(1);
        }
    }

    fn on_pass_finish(&self, pass: usize, best: Option<&GridPoint>) {
        let _ = pass;
        if let Some(bar) = self.current() {
            match best.and_then(|p| p.accuracy.map(|a| (p, a))) {
                Some((point, accuracy)) => bar.finish_with_message(format!(
                    "best l1={} accuracy={accuracy:.4}",
                    point.params.l1
                )),
                None => bar.finish_and_clear(),
            }
        }
    }
}
