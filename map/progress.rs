use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::fmt;
use std::io::IsTerminal;

/// Stages reported while scoring a raster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScoreProgressStage {
    Scoring,
}

impl ScoreProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Scoring => "raster scoring",
        }
    }
}

impl fmt::Display for ScoreProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress while scoring grid rows.
pub trait ScoreProgressObserver {
    fn on_stage_start(&mut self, stage: ScoreProgressStage, total_rows: usize) {
        let _ = (stage, total_rows);
    }
    fn on_stage_advance(&mut self, stage: ScoreProgressStage, processed_rows: usize) {
        let _ = (stage, processed_rows);
    }
    fn on_stage_finish(&mut self, stage: ScoreProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopScoreProgress;

impl ScoreProgressObserver for NoopScoreProgress {}

/// Terminal progress bar; drawn only when stderr is a terminal.
#[derive(Default)]
pub struct ConsoleScoreProgress {
    bar: Option<ProgressBar>,
}

impl ScoreProgressObserver for ConsoleScoreProgress {
    fn on_stage_start(&mut self, stage: ScoreProgressStage, total_rows: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_rows as u64), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} rows ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(stage.to_string());
        self.bar = Some(bar);
    }

    fn on_stage_advance(&mut self, _: ScoreProgressStage, processed_rows: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(processed_rows as u64);
        }
    }

    fn on_stage_finish(&mut self, stage: ScoreProgressStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}
