use crate::config::TelegramConfig;
use crate::health::ClassificationKind;
use crate::notify::{Notification, NotificationKind};
use crate::parser::{DeviceStatus, FailureReason};
use crate::state::State;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, Message, MessageId,
    ParseMode,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("ошибка запроса Telegram: {0}")]
    Request(#[from] teloxide::RequestError),
}

#[derive(Clone)]
struct TelegramRuntime {
    cfg: TelegramConfig,
    shared_state: Arc<RwLock<State>>,
    allowed_chats: HashSet<i64>,
    limiter: Arc<Mutex<RateLimiter>>,
    dashboard_messages: Arc<Mutex<HashMap<i64, i32>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Help,
    Status,
    NotifyOn,
    NotifyOff,
    ToggleNotify,
}

impl Action {
    fn from_command(text: &str) -> Option<Self> {
        let first = text.split_whitespace().next()?;
        let normalized = first.split('@').next()?.to_lowercase();
        match normalized.as_str() {
            "/start" => Some(Self::Start),
            "/help" => Some(Self::Help),
            "/status" | "/raid" => Some(Self::Status),
            "/notify_on" => Some(Self::NotifyOn),
            "/notify_off" => Some(Self::NotifyOff),
            _ => None,
        }
    }

    fn from_callback(data: &str) -> Option<Self> {
        match data {
            "refresh" | "status" => Some(Self::Status),
            "notify_toggle" => Some(Self::ToggleNotify),
            "help" => Some(Self::Help),
            _ => None,
        }
    }
}

struct RenderedView {
    text: String,
    keyboard: InlineKeyboardMarkup,
}

pub async fn run_bot(
    bot: Bot,
    cfg: TelegramConfig,
    shared_state: Arc<RwLock<State>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TelegramError> {
    let runtime = TelegramRuntime {
        cfg: cfg.clone(),
        shared_state,
        allowed_chats: cfg.allowed_chat_ids.iter().copied().collect(),
        limiter: Arc::new(Mutex::new(RateLimiter::new(cfg.rate_limit_per_minute))),
        dashboard_messages: Arc::new(Mutex::new(HashMap::new())),
    };

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![runtime])
        .build();

    let mut dispatch_handle = tokio::spawn(async move {
        dispatcher.dispatch().await;
    });

    tokio::select! {
        _ = shutdown.changed() => {
            dispatch_handle.abort();
            let _ = (&mut dispatch_handle).await;
            info!("остановка Telegram-бота");
            Ok(())
        }
        result = &mut dispatch_handle => {
            match result {
                Ok(()) => Ok(()),
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => {
                    warn!(error = %join_err, "задача Telegram завершилась с ошибкой");
                    Ok(())
                }
            }
        }
    }
}

async fn handle_message(bot: Bot, msg: Message, runtime: TelegramRuntime) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    if !should_handle_message(msg.chat.is_private(), chat_id, &runtime.allowed_chats) {
        return Ok(());
    }

    if !consume_rate_limit(&runtime, chat_id).await {
        bot.send_message(
            msg.chat.id,
            "Слишком много запросов. Попробуйте чуть позже.",
        )
        .await?;
        return Ok(());
    }

    let action = msg
        .text()
        .and_then(Action::from_command)
        .unwrap_or(Action::Start);

    let response = render_action(action, chat_id, &runtime).await;
    upsert_dashboard_message(&bot, msg.chat.id, &runtime, response).await?;
    Ok(())
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    runtime: TelegramRuntime,
) -> ResponseResult<()> {
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let Some(message) = q.message.as_ref() else {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    };

    let chat_id = message.chat.id.0;
    if !should_handle_message(message.chat.is_private(), chat_id, &runtime.allowed_chats) {
        bot.answer_callback_query(q.id).await?;
        return Ok(());
    }

    if !consume_rate_limit(&runtime, chat_id).await {
        bot.answer_callback_query(q.id)
            .text("Слишком много запросов. Попробуйте позже.")
            .await?;
        return Ok(());
    }

    {
        let mut map = runtime.dashboard_messages.lock().await;
        map.insert(chat_id, message.id.0);
    }

    if let Some(action) = Action::from_callback(data) {
        let response = render_action(action, chat_id, &runtime).await;
        upsert_dashboard_message(&bot, message.chat.id, &runtime, response).await?;
    }

    bot.answer_callback_query(q.id).await?;
    Ok(())
}

async fn render_action(action: Action, chat_id: i64, runtime: &TelegramRuntime) -> RenderedView {
    let default_enabled = runtime.cfg.notify_by_default;
    match action {
        Action::Start => RenderedView {
            text: "<b>raidmond</b> следит за RAID-массивами. Нажмите кнопку ниже для сводки."
                .to_string(),
            keyboard: main_menu(),
        },
        Action::Help => RenderedView {
            text: help_text(),
            keyboard: main_menu(),
        },
        Action::Status => {
            let state = runtime.shared_state.read().await;
            RenderedView {
                text: format_status(&state, chat_id, default_enabled),
                keyboard: main_menu(),
            }
        }
        Action::NotifyOn | Action::NotifyOff | Action::ToggleNotify => {
            let mut state = runtime.shared_state.write().await;
            let enabled = match action {
                Action::NotifyOn => true,
                Action::NotifyOff => false,
                _ => !state.notify_enabled_for_chat(chat_id, default_enabled),
            };
            state.set_notify_enabled_for_chat(chat_id, enabled);
            info!(chat_id, enabled, "изменены уведомления для чата");
            RenderedView {
                text: format_status(&state, chat_id, default_enabled),
                keyboard: main_menu(),
            }
        }
    }
}

fn main_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback("🔄 Обновить", "refresh")],
        vec![
            InlineKeyboardButton::callback("🔔 Уведомления вкл/выкл", "notify_toggle"),
            InlineKeyboardButton::callback("❓ Помощь", "help"),
        ],
    ])
}

fn help_text() -> String {
    [
        format!("<b>raidmond</b> {}", env!("CARGO_PKG_VERSION")),
        "/status - состояние RAID-массивов".to_string(),
        "/notify_on - включить уведомления о сбоях".to_string(),
        "/notify_off - отключить уведомления о сбоях".to_string(),
        "/help - эта справка".to_string(),
    ]
    .join("\n")
}

async fn consume_rate_limit(runtime: &TelegramRuntime, chat_id: i64) -> bool {
    let now = now_unix();
    let mut limiter = runtime.limiter.lock().await;
    limiter.allow(chat_id, now)
}

async fn upsert_dashboard_message(
    bot: &Bot,
    chat_id: ChatId,
    runtime: &TelegramRuntime,
    view: RenderedView,
) -> ResponseResult<()> {
    let existing = {
        let map = runtime.dashboard_messages.lock().await;
        map.get(&chat_id.0).copied()
    };

    if let Some(msg_id) = existing {
        let result = bot
            .edit_message_text(chat_id, MessageId(msg_id), view.text.clone())
            .parse_mode(ParseMode::Html)
            .reply_markup(view.keyboard.clone())
            .await;
        if result.is_ok() {
            return Ok(());
        }
    }

    let sent = bot
        .send_message(chat_id, view.text)
        .parse_mode(ParseMode::Html)
        .reply_markup(view.keyboard)
        .await?;

    let mut map = runtime.dashboard_messages.lock().await;
    map.insert(chat_id.0, sent.id.0);
    Ok(())
}

pub async fn run_notification_sender(
    bot: Bot,
    cfg: TelegramConfig,
    state: Arc<RwLock<State>>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("остановка отправки уведомлений Telegram");
                break;
            }
            next = notifications.recv() => {
                let Some(notification) = next else {
                    break;
                };
                let sent = send_notification(&bot, &cfg, state.clone(), &notification).await;
                info!(kind = notification.kind.as_str(), chats = sent, "уведомление отправлено в Telegram");
            }
        }
    }
}

async fn send_notification(
    bot: &Bot,
    cfg: &TelegramConfig,
    state: Arc<RwLock<State>>,
    notification: &Notification,
) -> usize {
    let text = format_notification(notification);
    let mut sent = 0_usize;

    for chat_id in &cfg.allowed_chat_ids {
        let enabled = {
            let guard = state.read().await;
            guard.notify_enabled_for_chat(*chat_id, cfg.notify_by_default)
        };
        if !enabled {
            continue;
        }

        if let Err(err) = bot
            .send_message(ChatId(*chat_id), text.clone())
            .parse_mode(ParseMode::Html)
            .reply_markup(main_menu())
            .await
        {
            warn!(chat_id = *chat_id, error = %err, "не удалось отправить уведомление о сбое RAID");
        } else {
            sent += 1;
        }
    }
    sent
}

fn format_notification(notification: &Notification) -> String {
    let marker = match notification.kind {
        NotificationKind::Entered => "🚨",
        NotificationKind::Repeat => "⚠ (повтор)",
    };
    format!(
        "{marker} <b>{}</b>\n{}",
        escape_html(&notification.title),
        escape_html(&notification.body)
    )
}

pub fn should_handle_message(is_private: bool, chat_id: i64, allowed: &HashSet<i64>) -> bool {
    is_private && allowed.contains(&chat_id)
}

#[derive(Debug)]
struct RateLimiter {
    limit_per_minute: u32,
    timestamps_by_chat: HashMap<i64, VecDeque<i64>>,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            timestamps_by_chat: HashMap::new(),
        }
    }

    fn allow(&mut self, chat_id: i64, now_unix: i64) -> bool {
        let queue = self.timestamps_by_chat.entry(chat_id).or_default();
        while let Some(ts) = queue.front().copied() {
            if now_unix - ts >= 60 {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.limit_per_minute as usize {
            return false;
        }

        queue.push_back(now_unix);
        true
    }
}

fn format_status(state: &State, chat_id: i64, default_enabled: bool) -> String {
    let headline = match state.kind() {
        None => "⏳ Ожидание первого опроса".to_string(),
        Some(ClassificationKind::Good) => "🟢 <b>Все массивы в порядке</b>".to_string(),
        Some(ClassificationKind::Missing) => "⚪ <b>RAID-массивы не найдены</b>".to_string(),
        Some(ClassificationKind::Bad) => format!(
            "🔴 <b>Сбой или деградация</b>: {}",
            escape_html(&state.failed_devices().join(", "))
        ),
    };

    let mut lines = vec![headline];
    if !state.source_available && state.poll_count > 0 {
        lines.push("Файл состояния недоступен".to_string());
    }
    for d in &state.devices {
        lines.push(format_device(d));
    }
    if let Some(since) = state.bad_since_unix {
        lines.push(format!("В состоянии сбоя с {}", format_unix(since)));
    }

    let notify = if state.notify_enabled_for_chat(chat_id, default_enabled) {
        "включены"
    } else {
        "отключены"
    };
    lines.push(format!("Уведомления: {notify}"));
    lines.push(format_last_poll_line(state.last_poll_timestamp_seconds));
    lines.join("\n")
}

fn format_device(d: &DeviceStatus) -> String {
    let personality = d.personality.as_deref().unwrap_or("?");
    let status = match (d.reason, d.recovering) {
        (Some(FailureReason::ExplicitFlag), _) => "❌ сбой".to_string(),
        (Some(FailureReason::DegradedMembers), _) => "⚠ деградация".to_string(),
        (None, true) => match d.recovery_percent {
            Some(pct) => format!("🔧 восстановление {pct:.1}%"),
            None => "🔧 восстановление".to_string(),
        },
        (None, false) => "✅ ok".to_string(),
    };
    format!("• <code>{}</code> ({personality}): {status}", escape_html(&d.name))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn format_unix(ts: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64);
    humantime::format_rfc3339_seconds(st).to_string()
}

fn format_last_poll_line(last_poll_ts: i64) -> String {
    if last_poll_ts <= 0 {
        return "Последний опрос: н/д".to_string();
    }

    let now = now_unix();
    let age = now.saturating_sub(last_poll_ts).max(0) as u64;
    let relative = if age < 60 {
        format!("{} сек назад", age)
    } else if age < 3600 {
        format!("{} мин назад", age / 60)
    } else {
        format!("{} ч назад", age / 3600)
    };

    format!(
        "Последний опрос: {} ({})",
        format_unix(last_poll_ts),
        relative
    )
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Classification;
    use crate::parser::parse_report;

    #[test]
    fn authorization_ignores_non_private_and_not_allowed() {
        let allowed: HashSet<i64> = [100].into_iter().collect();

        assert!(!should_handle_message(false, 100, &allowed));
        assert!(!should_handle_message(true, 101, &allowed));
        assert!(should_handle_message(true, 100, &allowed));
    }

    #[test]
    fn rate_limiter_enforces_limit() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.allow(1, 10));
        assert!(limiter.allow(1, 20));
        assert!(!limiter.allow(1, 30));
        assert!(limiter.allow(1, 71));
    }

    #[test]
    fn commands_map_to_actions() {
        assert_eq!(Action::from_command("/status"), Some(Action::Status));
        assert_eq!(Action::from_command("/notify_off@raidmond_bot"), Some(Action::NotifyOff));
        assert_eq!(Action::from_command("/NOTIFY_ON now"), Some(Action::NotifyOn));
        assert_eq!(Action::from_command("hello"), None);
        assert_eq!(Action::from_callback("notify_toggle"), Some(Action::ToggleNotify));
    }

    #[test]
    fn status_lists_devices_and_notify_pref() {
        let report = parse_report("Personalities : [raid1] [raid5]\nmd0 : active raid1 sdb1[1] sda1[0](F)\n      1048512 blocks [2/1] [U_]\n\nmd1 : active raid5 sdc1[2] sdb2[1] sda2[0]\n      2096128 blocks level 5, 64k chunk, algorithm 2 [3/2] [UU_]\n      [====>................]  recovery = 21.5% (225344/1048064) finish=0.3min speed=45068K/sec\n\nunused devices: <none>\n");
        let mut state = State::new(0);
        state.classification = Some(report.classification());
        state.devices = report.devices;
        state.set_notify_enabled_for_chat(7, false);

        let text = format_status(&state, 7, true);
        assert!(text.contains("Сбой или деградация</b>: md0"));
        assert!(text.contains("<code>md0</code> (raid1): ❌ сбой"));
        assert!(text.contains("<code>md1</code> (raid5): 🔧 восстановление 21.5%"));
        assert!(text.contains("Уведомления: отключены"));
    }

    #[test]
    fn status_before_first_poll() {
        let state = State::new(0);
        let text = format_status(&state, 1, true);
        assert!(text.starts_with("⏳"));
        assert!(text.contains("Последний опрос: н/д"));

        let mut state = State::new(0);
        state.classification = Some(Classification::Missing);
        state.poll_count = 1;
        let text = format_status(&state, 1, true);
        assert!(text.contains("не найдены"));
        assert!(text.contains("Файл состояния недоступен"));
    }

    #[test]
    fn notification_text_is_escaped() {
        let n = Notification::new(
            NotificationKind::Repeat,
            "RAID failed or degraded",
            &["md<0>".to_string()],
        );
        let text = format_notification(&n);
        assert!(text.contains("повтор"));
        assert!(text.contains("Device: md&lt;0&gt;"));
    }
}
