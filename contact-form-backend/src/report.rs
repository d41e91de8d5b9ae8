//! Daily digest of blocked submissions, mailed as HTML.

use crate::{
    mailer::{DispatchError, Mailer},
    spam_log::{SpamLog, SpamRecord, StorageError},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tinytemplate::{error::Error as TemplateError, format, TinyTemplate};
use tracing::info;

const REPORT_TEMPLATE_NAME: &str = "spam-report";
const REPORT_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/spam-report.html"
));

pub const REPORT_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
const REPORT_PERIOD_DESCRIPTION: &str = "Last 24 hours";

const MAX_MESSAGE_CHARS: usize = 200;
const MIN_WORD_BREAK_CHARS: usize = 150;
const EMPTY_PLACEHOLDER: &str = "(empty)";
const NOTE_STYLE: &str = "color: #666; font-style: italic;";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to read spam log: {0}")]
    Storage(#[from] StorageError),
    #[error("Failed to render spam report: {0}")]
    Template(#[from] TemplateError),
    #[error("Failed to send spam report: {0}")]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    NothingToReport,
    Sent(usize),
}

#[derive(Serialize)]
struct ReportContext<'a> {
    report_date: String,
    total: usize,
    period: &'static str,
    entries: Vec<EntryContext<'a>>,
}

#[derive(Serialize)]
struct EntryContext<'a> {
    time: String,
    sender_email: &'a str,
    subject: &'a str,
    message: &'a str,
    reason: &'a str,
    client_ip: &'a str,
}

impl<'a> From<&'a SpamRecord> for EntryContext<'a> {
    fn from(record: &'a SpamRecord) -> Self {
        Self {
            time: record.timestamp.format("%b %-d %H:%M:%S").to_string(),
            sender_email: &record.sender_email,
            subject: &record.subject,
            message: &record.message,
            reason: &record.reason,
            client_ip: &record.client_ip,
        }
    }
}

/// Renders the report for `records` in the order given.
pub fn build_report(
    records: &[SpamRecord],
    generated_at: DateTime<Utc>,
) -> Result<String, TemplateError> {
    let mut tt = TinyTemplate::new();
    tt.add_formatter("or_empty", render_or_empty);
    tt.add_formatter("message_cell", render_message_cell);
    tt.add_template(REPORT_TEMPLATE_NAME, REPORT_TEMPLATE)?;
    let context = ReportContext {
        report_date: generated_at.format("%B %-d, %Y").to_string(),
        total: records.len(),
        period: REPORT_PERIOD_DESCRIPTION,
        entries: records.iter().map(EntryContext::from).collect(),
    };
    tt.render(REPORT_TEMPLATE_NAME, &context)
}

fn render_or_empty(value: &Value, output: &mut String) -> Result<(), TemplateError> {
    if value.as_str().is_some_and(str::is_empty) {
        output.push_str(EMPTY_PLACEHOLDER);
        return Ok(());
    }
    format(value, output)
}

fn render_message_cell(value: &Value, output: &mut String) -> Result<(), TemplateError> {
    let mut escaped = String::new();
    format(value, &mut escaped)?;
    if escaped.is_empty() {
        output.push_str(&note(EMPTY_PLACEHOLDER));
    } else {
        output.push_str(&shorten_message(&escaped));
    }
    Ok(())
}

/// Cuts an already escaped message to at most 200 characters, preferring to break at a space
/// past character 150. Messages which fit keep their line breaks.
fn shorten_message(escaped: &str) -> String {
    if escaped.chars().count() <= MAX_MESSAGE_CHARS {
        return escaped.replace('\n', "<br>").replace('\r', "");
    }
    let cut: String = escaped.chars().take(MAX_MESSAGE_CHARS).collect();
    let cut = match cut.rfind(' ') {
        Some(space) if cut[..space].chars().count() > MIN_WORD_BREAK_CHARS => &cut[..space],
        _ => cut.as_str(),
    };
    format!("{cut}{}", note("... (truncated)"))
}

fn note(text: &str) -> String {
    format!(r#"<span class="truncated" style="{NOTE_STYLE}">{text}</span>"#)
}

/// Mails the last day's spam records to the report recipient.
pub struct SpamReporter {
    spam_log: SpamLog,
    mailer: Mailer,
}

impl SpamReporter {
    pub fn new(spam_log: SpamLog, mailer: Mailer) -> Self {
        Self { spam_log, mailer }
    }

    /// Sends nothing when no spam was recorded in the period.
    pub async fn run(&self) -> Result<ReportOutcome, ReportError> {
        let records = self.spam_log.query(REPORT_PERIOD).await?;
        if records.is_empty() {
            info!("No spam recorded in the last 24 hours");
            return Ok(ReportOutcome::NothingToReport);
        }

        let html = build_report(&records, Utc::now())?;
        let subject = format!("Daily Spam Report - {} entries blocked", records.len());
        self.mailer.send_report(&subject, html).await?;
        info!(entries = records.len(), "Sent spam report");
        Ok(ReportOutcome::Sent(records.len()))
    }
}
