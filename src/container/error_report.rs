use crate::{
    container::pipeline::{Next, Valve},
    http::{action::Exchange, types::reason_phrase},
};
use tracing::warn;

/// Renders an HTML page for error statuses the rest of the chain left without
/// a body, and turns valve failures into `500` pages.
///
/// Committed responses are left untouched.
#[derive(Debug, Default)]
pub struct ErrorReportValve;

impl Valve for ErrorReportValve {
    fn invoke(&self, exchange: &mut Exchange<'_>, next: Next<'_>) -> anyhow::Result<()> {
        let result = next.invoke(exchange);
        if exchange.response().is_committed() {
            return result;
        }

        if let Err(e) = result {
            warn!(error = %e, uri = exchange.request().uri(), "request failed in pipeline");
            exchange.response_mut().reset()?;
            exchange.response_mut().set_status(500u16);
        }

        let status = exchange.response().status();
        if status < 400 {
            return Ok(());
        }

        let page = render(status, exchange.response().message());
        exchange
            .response_mut()
            .set_content_type("text/html")
            .set_character_encoding("utf-8")
            .set_content_length(page.len() as u64);
        exchange.write_body(page.as_bytes())?;
        Ok(())
    }

    fn name(&self) -> &str {
        "ErrorReportValve"
    }
}

fn render(status: u16, message: &str) -> String {
    let reason = match message.is_empty() {
        true => reason_phrase(status),
        false => message,
    };
    format!(
        "<!doctype html><html><head><title>HTTP Status {status} - {reason}</title></head>\
         <body><h1>HTTP Status {status} - {reason}</h1></body></html>"
    )
}
