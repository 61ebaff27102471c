use axum::serve;
use clap::Parser;
use raidmond::collectors::mdstat::collect_report;
use raidmond::config::{self, Config};
use raidmond::health::Classification;
use raidmond::metrics::Metrics;
use raidmond::notify::{ChannelNotifier, LogNotifier, Notifiers, NotifyToggle};
use raidmond::scheduler::{self, Monitor};
use raidmond::state::State;
use raidmond::{http, parser, telegram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use teloxide::Bot;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "raidmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "telegram_off")]
    telegram_on: bool,
    #[arg(long, conflicts_with = "telegram_on")]
    telegram_off: bool,
    /// Start with notifications suppressed.
    #[arg(long)]
    notify_off: bool,
    /// Poll once, print the classification and exit (0 good, 1 bad, 2 missing).
    #[arg(long)]
    check: bool,
    /// Override the status report path.
    #[arg(long)]
    mdstat: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    if cli.check {
        let path = match cli.mdstat.clone() {
            Some(path) => path,
            None => check_source_path(&cli.config),
        };
        std::process::exit(run_check(&path));
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    if cli.telegram_on {
        cfg.telegram.enabled = true;
    } else if cli.telegram_off {
        cfg.telegram.enabled = false;
    }
    if cli.notify_off {
        cfg.notify.enabled = false;
    }
    if let Some(path) = cli.mdstat.clone() {
        cfg.mdstat_path = path;
    }

    let telegram_token = if cfg.telegram.enabled {
        match ensure_telegram_settings(&cfg) {
            Ok(token) => Some(token),
            Err(err) => {
                error!(error = %err, "не удалось подготовить настройки Telegram");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    info!(
        listen = %cfg.listen,
        mdstat = %cfg.mdstat_path,
        interval_secs = cfg.interval_secs,
        "запуск raidmond"
    );

    let now = now_unix();
    let shared_state = Arc::new(RwLock::new(State::new(now)));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };
    let notify_toggle = NotifyToggle::new(cfg.notify.enabled);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let notify_toggle = notify_toggle.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state, notify_toggle);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let telegram_bot = telegram_token.map(Bot::new);

    let mut notifiers = Notifiers::new(notify_toggle).with(LogNotifier);
    let mut telegram_tasks = Vec::new();
    if let Some(bot) = telegram_bot {
        let (tx, rx) = mpsc::unbounded_channel();
        notifiers = notifiers.with(ChannelNotifier::new(tx));

        {
            let bot = bot.clone();
            let telegram_cfg = cfg.telegram.clone();
            let state = shared_state.clone();
            let shutdown = shutdown_rx.clone();
            telegram_tasks.push(tokio::spawn(async move {
                if let Err(err) = telegram::run_bot(bot, telegram_cfg, state, shutdown).await {
                    error!(error = %err, "ошибка задачи Telegram");
                }
            }));
        }

        let telegram_cfg = cfg.telegram.clone();
        let state = shared_state.clone();
        let shutdown = shutdown_rx.clone();
        telegram_tasks.push(tokio::spawn(telegram::run_notification_sender(
            bot,
            telegram_cfg,
            state,
            rx,
            shutdown,
        )));
    }

    let monitor = Monitor::new(notifiers, cfg.notify.title.clone());
    let poll_task = tokio::spawn(scheduler::run(
        monitor,
        cfg.clone(),
        metrics.clone(),
        shared_state.clone(),
        shutdown_rx.clone(),
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = poll_task.await;
    for task in telegram_tasks {
        let _ = task.await;
    }
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn check_source_path(config_path: &str) -> String {
    match Config::load_from_file(config_path) {
        Ok(cfg) => cfg.mdstat_path,
        Err(err) => {
            warn!(
                error = %err,
                fallback = config::DEFAULT_MDSTAT_PATH,
                "конфигурация не загружена, проверяется путь по умолчанию"
            );
            config::DEFAULT_MDSTAT_PATH.to_string()
        }
    }
}

fn run_check(path: &str) -> i32 {
    let snapshot = collect_report(path);
    let report = parser::parse_report(&snapshot.text);
    let classification = report.classification();

    println!("{}", format_check_line(&classification));
    for d in &report.devices {
        let verdict = if d.failed {
            "failed"
        } else if d.recovering {
            "recovering"
        } else {
            "ok"
        };
        println!(
            "  {} ({}): {verdict}",
            d.name,
            d.personality.as_deref().unwrap_or("?")
        );
    }

    check_exit_code(&classification)
}

fn format_check_line(classification: &Classification) -> String {
    match classification {
        Classification::Good => "GOOD".to_string(),
        Classification::Missing => "MISSING".to_string(),
        Classification::Bad(devices) => format!("BAD: {}", devices.join(", ")),
    }
}

fn check_exit_code(classification: &Classification) -> i32 {
    match classification {
        Classification::Good => 0,
        Classification::Bad(_) => 1,
        Classification::Missing => 2,
    }
}

fn resolve_telegram_token_from_env(env_name: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_name) {
        if !v.trim().is_empty() {
            return Some(v);
        }
    }
    None
}

fn ensure_telegram_settings(cfg: &Config) -> Result<String, String> {
    let env_name = cfg.telegram.bot_token_env.clone();
    let env_token = resolve_telegram_token_from_env(&env_name);
    let cfg_token = cfg
        .telegram
        .bot_token
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    if cfg.telegram.allowed_chat_ids.is_empty() {
        return Err(
            "telegram.allowed_chat_ids пуст: укажите хотя бы один chat id в config".to_string(),
        );
    }

    if let Some(v) = env_token {
        return Ok(v);
    }
    if let Some(v) = cfg_token {
        return Ok(v);
    }

    Err(format!(
        "не найден токен Telegram: задайте '{}' в окружении или telegram.bot_token в config",
        env_name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_line_and_exit_code() {
        let bad = Classification::Bad(vec!["md0".to_string(), "md2".to_string()]);
        assert_eq!(format_check_line(&bad), "BAD: md0, md2");
        assert_eq!(check_exit_code(&bad), 1);
        assert_eq!(format_check_line(&Classification::Good), "GOOD");
        assert_eq!(check_exit_code(&Classification::Good), 0);
        assert_eq!(check_exit_code(&Classification::Missing), 2);
    }

    #[test]
    fn check_path_comes_from_config_or_default() {
        let dir = std::env::temp_dir();
        let good = dir.join(format!("raidmond-check-{}.yaml", std::process::id()));
        std::fs::write(&good, "listen: \"127.0.0.1:9109\"\nmdstat_path: \"/tmp/md-custom\"\n")
            .unwrap();
        assert_eq!(check_source_path(good.to_str().unwrap()), "/tmp/md-custom");

        let broken = dir.join(format!("raidmond-check-broken-{}.yaml", std::process::id()));
        std::fs::write(&broken, "listen: [not, an, address\n").unwrap();
        assert_eq!(
            check_source_path(broken.to_str().unwrap()),
            config::DEFAULT_MDSTAT_PATH
        );

        let _ = std::fs::remove_file(&good);
        let _ = std::fs::remove_file(&broken);
    }

    #[test]
    fn telegram_requires_chat_ids() {
        let mut cfg: Config = serde_yaml::from_str("listen: \"127.0.0.1:9109\"\n").unwrap();
        cfg.telegram.enabled = true;
        cfg.telegram.bot_token = Some("token".to_string());
        assert!(ensure_telegram_settings(&cfg).is_err());

        cfg.telegram.allowed_chat_ids = vec![1];
        cfg.telegram.bot_token_env = "RAIDMOND_TEST_TOKEN_UNSET".to_string();
        assert_eq!(ensure_telegram_settings(&cfg).as_deref(), Ok("token"));
    }
}
