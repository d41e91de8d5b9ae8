use serde::Serialize;
use serde_json::Value;
use tinytemplate::{error::Error, format, TinyTemplate};

const SEND_ERROR_TEMPLATE_NAME: &str = "send-error-template";
const SEND_ERROR_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/send-error.html"
));

#[derive(Serialize)]
struct Context<'a> {
    subject: &'a str,
    message: &'a str,
}

/// Page shown when a message could not be forwarded. It repeats what the visitor wrote so that
/// it is not lost.
pub fn render_error_page(subject: &str, message: &str) -> Result<String, Error> {
    let mut tt = TinyTemplate::new();
    tt.add_formatter("render_paragraphs", render_paragraphs);
    tt.add_template(SEND_ERROR_TEMPLATE_NAME, SEND_ERROR_TEMPLATE)?;
    tt.render(SEND_ERROR_TEMPLATE_NAME, &Context { subject, message })
}

fn render_paragraphs(value: &Value, output: &mut String) -> Result<(), Error> {
    output.push_str("<p>");
    let mut formatted = String::new();
    format(value, &mut formatted)?;
    output.push_str(&formatted.replace("\r\n", "\n").replace("\n\n", "</p><p>"));
    output.push_str("</p>");
    Ok(())
}
