/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: notifications.rs
 * Author: mingcheng <mingcheng@apache.org>
 * File Created: 2026-02-27 15:47:40
 *
 * Modified By: mingcheng <mingcheng@apache.org>
 * Last Modified: 2026-03-04 10:12:51
 */

use crate::passcode::Passcode;
use crate::telegram::TelegramClient;
use crate::traits::Notifier;
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use futures::future::join_all;
use log::{error, info};

pub const NOT_FOUND_SENTINEL: &str = "Passcode not found in the email.";

// Characters Telegram's MarkdownV2 parser treats as markup outside code spans
const MARKDOWN_V2_RESERVED: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
    '\\',
];

/// Delivers notifications through the Telegram Bot API as MarkdownV2.
pub struct TelegramNotifier {
    client: TelegramClient,
}

impl TelegramNotifier {
    pub fn new(client: TelegramClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        self.client
            .send_message(chat_id, text, Some("MarkdownV2"))
            .await
    }
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub chat_id: String,
    pub result: anyhow::Result<()>,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Sends `text` to every target concurrently. A failing target never stops
/// the others; outcomes come back in target order.
pub async fn deliver(
    notifier: &dyn Notifier,
    targets: &[String],
    text: &str,
) -> Vec<DeliveryOutcome> {
    let attempts = targets.iter().map(|chat_id| async move {
        let result = notifier.send(chat_id, text).await;
        match &result {
            Ok(()) => info!("Message sent to Telegram chat {}", chat_id),
            Err(e) => error!("Error sending message to Telegram chat {}: {:?}", chat_id, e),
        }
        DeliveryOutcome {
            chat_id: chat_id.clone(),
            result,
        }
    });

    join_all(attempts).await
}

/// Formats the two-line notification: received time, then the passcode as an
/// inline code span or the not-found sentinel.
pub fn format_notification(received_at: DateTime<Utc>, passcode: Option<&Passcode>) -> String {
    let local = received_at.with_timezone(&Local);
    let date_line = format!("Date: {}", local.format("%Y-%m-%d %H:%M:%S %:z"));

    let code_line = match passcode {
        // digits never need escaping inside a code span
        Some(code) => format!("Passcode: `{}`", code),
        None => escape_markdown_v2(NOT_FOUND_SENTINEL),
    };

    format!("{}\n{}", escape_markdown_v2(&date_line), code_line)
}

/// Escapes every MarkdownV2 reserved character with a backslash.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        if MARKDOWN_V2_RESERVED.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
