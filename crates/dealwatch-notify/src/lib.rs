//! HTML digest rendering for grouped offers and SMTP delivery of the result.

use std::time::Duration;

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, Utc};
use dealwatch_core::{ExportConfig, OfferRecord};
use dealwatch_dedup::GroupedOffers;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::Serialize;
use tracing::info;

pub const CRATE_NAME: &str = "dealwatch-notify";

pub const DEFAULT_DIGEST_TITLE: &str = "Oferty dnia";
pub const DEFAULT_MAIL_SUBJECT: &str = "Oferty LZX i Pepper";
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Everything the digest template shows, already flattened to display records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Digest {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub source_ids: Vec<String>,
    pub unique: Vec<OfferRecord>,
    pub duplicates: Vec<Vec<OfferRecord>>,
}

impl Digest {
    pub fn from_grouped(
        grouped: &GroupedOffers,
        export: &ExportConfig,
        source_ids: Vec<String>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            title: DEFAULT_DIGEST_TITLE.to_string(),
            generated_at,
            source_ids,
            unique: grouped.unique_records(export),
            duplicates: grouped.duplicate_records(export),
        }
    }

    pub fn offer_count(&self) -> usize {
        self.unique.len() + self.duplicates.iter().map(Vec::len).sum::<usize>()
    }
}

#[derive(Template)]
#[template(path = "digest.html")]
struct DigestTemplate<'a> {
    title: &'a str,
    generated_at: String,
    sources: String,
    unique: &'a [OfferRecord],
    duplicates: &'a [Vec<OfferRecord>],
}

pub fn render_digest(digest: &Digest, export: &ExportConfig) -> Result<String> {
    let tpl = DigestTemplate {
        title: &digest.title,
        generated_at: digest
            .generated_at
            .with_timezone(&export.timezone)
            .format("%Y-%m-%d %H:%M")
            .to_string(),
        sources: digest.source_ids.join(", "),
        unique: &digest.unique,
        duplicates: &digest.duplicates,
    };
    tpl.render().context("rendering digest template")
}

/// SMTP settings for sending the digest; STARTTLS on the submission port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
}

impl MailConfig {
    /// Builds the config from `DEALWATCH_SMTP_*` / `DEALWATCH_MAIL_*` keys. Returns
    /// `None` unless a host, a sender (explicit or the SMTP user) and a recipient are set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get("DEALWATCH_SMTP_HOST")?;
        let username = get("DEALWATCH_SMTP_USER");
        let from = get("DEALWATCH_MAIL_FROM").or_else(|| username.clone())?;
        let to: Vec<String> = get("DEALWATCH_MAIL_TO")?
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        if to.is_empty() {
            return None;
        }
        Some(Self {
            host,
            port: get("DEALWATCH_SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            username,
            password: get("DEALWATCH_SMTP_PASSWORD"),
            from,
            to,
            subject: get("DEALWATCH_MAIL_SUBJECT").unwrap_or_else(|| DEFAULT_MAIL_SUBJECT.to_string()),
        })
    }
}

fn mailbox(addr: &str) -> Result<Mailbox> {
    addr.parse().with_context(|| format!("invalid mail address {addr:?}"))
}

/// Wraps a rendered digest into an HTML email.
pub fn build_digest_message(config: &MailConfig, html: String) -> Result<Message> {
    let mut builder = Message::builder()
        .from(mailbox(&config.from)?)
        .subject(config.subject.as_str());
    for addr in &config.to {
        builder = builder.to(mailbox(addr)?);
    }
    builder
        .header(ContentType::TEXT_HTML)
        .body(html)
        .context("building digest email")
}

pub struct Mailer {
    config: MailConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl Mailer {
    pub fn new(config: MailConfig) -> Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .with_context(|| format!("configuring SMTP relay {}", config.host))?
            .port(config.port)
            .timeout(Some(Duration::from_secs(30)));
        if let Some(user) = &config.username {
            builder = builder.credentials(Credentials::new(
                user.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }
        Ok(Self {
            transport: builder.build(),
            config,
        })
    }

    pub fn config(&self) -> &MailConfig {
        &self.config
    }

    pub async fn send_digest(&self, html: String) -> Result<()> {
        let message = build_digest_message(&self.config, html)?;
        self.transport
            .send(message)
            .await
            .with_context(|| format!("sending digest via {}:{}", self.config.host, self.config.port))?;
        info!(to = ?self.config.to, "digest email sent");
        Ok(())
    }
}
