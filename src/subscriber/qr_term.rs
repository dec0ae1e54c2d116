//! Terminal QR renderer.

use super::{DeliveryContext, EventSubscriber};
use crate::types::{is_plausible_qr, Event};
use qrcode::render::unicode;
use qrcode::QrCode;

/// Renders each pairing code to stdout once, then stays quiet. Purely a
/// convenience for operators pairing from a shell; the pipeline does not
/// depend on it.
pub struct QrTerminal;

impl QrTerminal {
    pub fn render(code: &str) -> anyhow::Result<String> {
        let qr = QrCode::new(code.as_bytes())?;
        Ok(qr
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build())
    }
}

#[async_trait::async_trait]
impl EventSubscriber for QrTerminal {
    fn name(&self) -> &'static str {
        "qr-terminal"
    }

    fn accepts(&self, event: &Event) -> bool {
        matches!(event, Event::Qr { .. })
    }

    async fn deliver(&self, ctx: &DeliveryContext, event: &Event) -> anyhow::Result<()> {
        let Event::Qr { code, expires_at } = event else {
            return Ok(());
        };
        if !is_plausible_qr(code) {
            tracing::warn!(session = %ctx.session_name, "refusing to render implausible qr code");
            return Ok(());
        }
        let image = Self::render(code)?;
        println!(
            "Scan to pair session {:?} (valid until {}):\n{image}",
            ctx.session_name, expires_at
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_nonempty_unicode_block() {
        let image = QrTerminal::render("2@abcdefghijklmnop").unwrap();
        assert!(!image.is_empty());
    }
}
