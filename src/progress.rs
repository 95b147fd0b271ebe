use crate::listener::TransferListener;
use crate::record::TransferRecord;
use crate::status::TransferStatus;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Progress bar of one transfer.
pub struct TransferProgress {
    tag: String,
    progress_bar: ProgressBar,
    start_time: Instant,
    end_time: Mutex<Option<Instant>>,
}

impl TransferProgress {
    pub fn new(tag: &str, multi: &MultiProgress) -> Self {
        let pb = multi.add(ProgressBar::new(0));
        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            tag: tag.to_string(),
            progress_bar: pb,
            start_time: Instant::now(),
            end_time: Mutex::new(None),
        }
    }

    pub fn update(&self, record: &TransferRecord) {
        if record.has_known_total() {
            self.progress_bar.set_length(record.total_size as u64);
        }
        self.progress_bar.set_position(record.current_size.max(0) as u64);

        let total = if record.has_known_total() {
            bytesize::to_string(record.total_size as u64, true)
        } else {
            "?".to_string()
        };
        self.progress_bar.set_message(format!(
            "{} | {} | {}/{} | {}/s | elapsed={}",
            self.tag,
            record.status,
            bytesize::to_string(record.current_size.max(0) as u64, true),
            total,
            bytesize::to_string(record.speed.max(0) as u64, true),
            humantime::format_duration(self.elapsed_secs())
        ));
    }

    fn mark_ended(&self) {
        if let Ok(mut end) = self.end_time.lock() {
            end.get_or_insert_with(Instant::now);
        }
    }

    pub fn finish(&self, file: &Path) {
        self.mark_ended();
        self.progress_bar.finish_with_message(format!(
            "{} ✅ {} in {}",
            self.tag,
            file.display(),
            humantime::format_duration(self.elapsed_secs())
        ));
    }

    pub fn fail(&self, record: &TransferRecord) {
        self.mark_ended();
        let cause = record
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".into());
        self.progress_bar
            .abandon_with_message(format!("{} ❌ {}", self.tag, cause));
    }

    /// Whole seconds, so the rendered duration stays short.
    fn elapsed_secs(&self) -> Duration {
        let end = self
            .end_time
            .lock()
            .ok()
            .and_then(|end| *end)
            .unwrap_or_else(Instant::now);
        Duration::from_secs(end.duration_since(self.start_time).as_secs())
    }
}

/// Listener rendering every transfer it observes as one bar of a shared display.
pub struct ProgressDisplay {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, Arc<TransferProgress>>>,
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressDisplay {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar(&self, tag: &str) -> Arc<TransferProgress> {
        let mut bars = self.bars.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            bars.entry(tag.to_string())
                .or_insert_with(|| Arc::new(TransferProgress::new(tag, &self.multi))),
        )
    }

    /// Prints a line above the bars without tearing them.
    pub fn println(&self, line: impl AsRef<str>) {
        if self.multi.println(line.as_ref()).is_err() {
            println!("{}", line.as_ref());
        }
    }
}

impl TransferListener for ProgressDisplay {
    fn on_start(&self, record: &TransferRecord) {
        self.bar(&record.tag).update(record);
    }

    fn on_progress(&self, record: &TransferRecord) {
        if matches!(record.status, TransferStatus::Error | TransferStatus::Finish) {
            return;
        }
        self.bar(&record.tag).update(record);
    }

    fn on_error(&self, record: &TransferRecord) {
        self.bar(&record.tag).fail(record);
        self.bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&record.tag);
    }

    fn on_finish(&self, file: &Path, record: &TransferRecord) {
        let bar = self.bar(&record.tag);
        bar.update(record);
        bar.finish(file);
        self.bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&record.tag);
    }

    fn on_remove(&self, record: &TransferRecord) {
        if let Some(bar) = self
            .bars
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&record.tag)
        {
            bar.progress_bar
                .abandon_with_message(format!("{} removed", record.tag));
        }
    }
}
