use std::io::{self, Write};
use std::sync::Mutex;

use serde::Serialize;

use crate::app::{FetchAction, FetchResult, PathResult, ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_path(result: &PathResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

#[derive(Default)]
pub struct ConsoleProgress {
    last: Mutex<Option<(u32, String)>>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let percent = (event.fraction * 100.0).floor() as u32;
        let head = event
            .message
            .split_whitespace()
            .take(2)
            .collect::<Vec<_>>()
            .join(" ");
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((last_percent, last_head)) = last.as_ref() {
            if *last_percent == percent && *last_head == head && event.fraction < 1.0 {
                return;
            }
        }
        *last = Some((percent, head));
        eprintln!("[{:>5.1}%] {}", event.fraction * 100.0, event.message);
    }
}

pub fn print_fetch_summary(result: &FetchResult) {
    let green = "\x1b[32m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    match result.action {
        FetchAction::Skipped => {
            println!(
                "{green}already downloaded: {}/{}{reset}",
                result.dataset, result.product
            );
        }
        FetchAction::Download => {
            println!(
                "{cyan}downloaded {}/{} ({} files){reset}",
                result.dataset,
                result.product,
                result.files.len()
            );
        }
    }
    println!("   path: {}", result.path);
    for file in &result.files {
        println!("   - {file}");
    }
}
