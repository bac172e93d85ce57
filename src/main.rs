mod cache;
mod capture;
mod common;
mod http_client;
mod inspect;
mod model;
mod pricing;
mod tape;
mod usage;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cache::build_cache_store;
use capture::{
    CaptureServices, ProxyInstance, RequestRecord, RequestRegistry, RequestStatus,
    serve_proxy, spawn_log_observer,
};
use http_client::build_client;
use model::config::{CacheMode, Config, ProxyConfig};
use pricing::{ModelsDb, NoPricing, PricingLookup};
use tape::{CostBreakdown, PlaybackClock, Tape, TapeRecorder, TapeWriter};

/// LLM API 调试代理：捕获、缓存、录制与回放
#[derive(Parser)]
#[command(name = "llmproxy-rs", version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 监听地址（与 --target 一起使用时覆盖配置中的代理列表）
    #[arg(long)]
    listen: Option<String>,

    /// 上游地址
    #[arg(long)]
    target: Option<String>,

    /// 缓存模式：none / memory / global
    #[arg(long)]
    cache: Option<CacheMode>,

    /// 缓存有效期，例如 30m、24h、7d
    #[arg(long)]
    cache_ttl: Option<String>,

    /// 实时录制 Tape 的文件路径
    #[arg(long)]
    record: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// 生成默认配置文件
    Init,
    /// 按模型汇总 Tape 中的 token 与费用
    Cost {
        tape: PathBuf,
        /// 输出 JSON
        #[arg(long)]
        json: bool,
    },
    /// 回放 Tape
    Replay {
        tape: PathBuf,
        /// 定位到指定进度（0.0 到 1.0）并输出该时刻的请求
        #[arg(long)]
        at: Option<f64>,
        /// 实时回放倍速
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        /// 逐个事件输出
        #[arg(long)]
        step: bool,
        /// 与 --step 一起使用：从结尾向前逐个事件输出
        #[arg(long, requires = "step")]
        reverse: bool,
        /// 只输出指定请求的最终记录（JSON）
        #[arg(long)]
        request: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let result = match &args.command {
        Some(Command::Init) => init_config(&args),
        Some(Command::Cost { tape, json }) => run_cost(tape, *json),
        Some(Command::Replay {
            tape,
            at,
            speed,
            step,
            reverse,
            request,
        }) => {
            let mode = match (at, *step, *reverse) {
                (Some(percent), _, _) => ReplayMode::At(*percent),
                (None, true, false) => ReplayMode::Step,
                (None, true, true) => ReplayMode::StepBackward,
                (None, false, _) => ReplayMode::RealTime(*speed),
            };
            run_replay(tape, mode, *request).await
        }
        None => run_proxy(&args).await,
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn config_path(args: &Args) -> String {
    args.config
        .clone()
        .unwrap_or_else(|| Config::default_config_path().to_string())
}

fn init_config(args: &Args) -> anyhow::Result<()> {
    let path = config_path(args);
    if Path::new(&path).exists() {
        anyhow::bail!("配置文件已存在: {}", path);
    }
    let mut config = Config::load(&path)?;
    apply_overrides(&mut config, args)?;
    config.validate()?;
    config.save()?;
    if let Some(saved) = config.config_path() {
        println!("已生成配置文件: {}", saved.display());
    }
    Ok(())
}

/// 命令行参数覆盖配置文件
fn apply_overrides(config: &mut Config, args: &Args) -> anyhow::Result<()> {
    match (&args.listen, &args.target) {
        (Some(listen), Some(target)) => {
            config.proxies = vec![ProxyConfig {
                name: String::new(),
                listen: listen.clone(),
                target: target.clone(),
            }];
        }
        (None, None) => {}
        _ => anyhow::bail!("--listen 与 --target 需要同时指定"),
    }
    if let Some(mode) = args.cache {
        config.cache.mode = mode;
    }
    if let Some(ttl) = &args.cache_ttl {
        config.cache.ttl = ttl.clone();
    }
    if let Some(path) = &args.record {
        config.record_tape = Some(path.clone());
    }
    Ok(())
}

/// 价格目录：后台拉取，拉取完成前费用按 0 计算
fn start_pricing(config: &Config) -> anyhow::Result<Arc<dyn PricingLookup>> {
    if !config.pricing.enabled {
        return Ok(Arc::new(NoPricing));
    }

    let db = Arc::new(ModelsDb::new());
    let client = build_client(config.proxy_url.as_deref(), Some(30))
        .context("创建价格目录 HTTP Client 失败")?;
    let url = config.pricing.url.clone();
    let fetch_db = db.clone();
    tokio::spawn(async move {
        match fetch_db.fetch(&client, &url).await {
            Ok(count) => tracing::info!("已加载模型价格目录: {} 个服务商", count),
            Err(e) => tracing::warn!("加载模型价格目录失败，费用按 0 计算: {}", e),
        }
    });
    Ok(db)
}

async fn run_proxy(args: &Args) -> anyhow::Result<()> {
    let mut config = Config::load(config_path(args))?;
    apply_overrides(&mut config, args)?;
    config.validate()?;

    let cache = build_cache_store(&config.cache).context("初始化响应缓存失败")?;
    let client = build_client(config.proxy_url.as_deref(), config.upstream_timeout_secs)
        .context("创建上游 HTTP Client 失败")?;
    let pricing = start_pricing(&config)?;

    let (registry, events) = RequestRegistry::with_observer(config.observer_capacity);
    let registry = Arc::new(registry);
    let observer = spawn_log_observer(events);

    let listens = config
        .proxies
        .iter()
        .map(|p| p.listen.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let targets = config
        .proxies
        .iter()
        .map(|p| p.target.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let tape = match &config.record_tape {
        Some(path) => {
            let mut recorder = TapeRecorder::create(path)
                .with_context(|| format!("创建 Tape 文件失败: {}", path))?;
            recorder.write_session_start(&listens, &targets)?;
            tracing::info!("实时录制 Tape: {}", path);
            Some(TapeWriter::spawn(recorder))
        }
        None => None,
    };

    let services = Arc::new(CaptureServices {
        registry: registry.clone(),
        cache: cache.clone(),
        simulate_latency: config.cache.simulate_latency,
        tape: tape.clone(),
        pricing,
        record_usage_updates: config.record_usage_updates,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = JoinSet::new();
    for proxy in &config.proxies {
        let instance = Arc::new(ProxyInstance::new(proxy, client.clone())?);
        let listener = TcpListener::bind(&proxy.listen)
            .await
            .with_context(|| format!("绑定监听地址失败: {}", proxy.listen))?;
        servers.spawn(serve_proxy(
            listener,
            instance,
            services.clone(),
            shutdown_rx.clone(),
        ));
    }

    if let Some(inspect_config) = &config.inspect {
        let listener = TcpListener::bind(&inspect_config.listen)
            .await
            .with_context(|| format!("绑定请求查看 API 地址失败: {}", inspect_config.listen))?;
        let app = inspect::create_inspect_router(inspect_config.api_key.clone(), registry.clone());
        servers.spawn(inspect::serve_inspect(listener, app, shutdown_rx.clone()));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("监听退出信号失败")?;
            tracing::info!("收到退出信号，正在关闭...");
        }
        Some(result) = servers.join_next() => {
            match result {
                Ok(Ok(())) => tracing::warn!("监听服务提前退出，正在关闭..."),
                Ok(Err(e)) => tracing::error!("监听服务异常退出: {}", e),
                Err(e) => tracing::error!("监听任务失败: {}", e),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(result) = servers.join_next().await {
        match result {
            Ok(Err(e)) => tracing::warn!("关闭监听服务时出错: {}", e),
            Err(e) => tracing::warn!("监听任务失败: {}", e),
            Ok(Ok(())) => {}
        }
    }

    if let Some(tape) = &tape {
        match tape.finish().await {
            Ok(count) => tracing::info!("Tape 录制结束（{} 个事件）", count),
            Err(e) => tracing::warn!("写入 Tape session_end 失败: {}", e),
        }
    }

    if !registry.is_empty() {
        tracing::info!("本次会话共捕获 {} 个请求", registry.len());
    }

    if let Some(path) = &config.save_tape {
        let records = registry.snapshot();
        match TapeRecorder::export_session(path, &listens, &targets, &records) {
            Ok(count) => tracing::info!("会话已导出: {}（{} 个事件）", path, count),
            Err(e) => tracing::warn!("导出会话失败: {}", e),
        }
    }

    if let Err(e) = cache.close() {
        tracing::warn!("关闭响应缓存失败: {}", e);
    }
    observer.abort();
    Ok(())
}

fn load_tape(path: &Path) -> anyhow::Result<Tape> {
    let tape = Tape::load(path).with_context(|| format!("读取 Tape 失败: {}", path.display()))?;
    if tape.skipped_lines > 0 {
        tracing::warn!("跳过 {} 行无法解析的事件", tape.skipped_lines);
    }
    Ok(tape)
}

fn run_cost(path: &Path, json: bool) -> anyhow::Result<()> {
    let tape = load_tape(path)?;
    let breakdown = CostBreakdown::from_tape(&tape);
    if json {
        println!("{}", serde_json::to_string_pretty(&breakdown)?);
    } else {
        println!(
            "Tape: {}  请求数: {}  时长: {}",
            tape.file_path.display(),
            tape.requests.len(),
            format_offset(tape.duration)
        );
        print!("{}", breakdown.render());
    }
    Ok(())
}

/// 回放方式
#[derive(Debug, Clone, Copy)]
enum ReplayMode {
    At(f64),
    Step,
    StepBackward,
    RealTime(f64),
}

async fn run_replay(path: &Path, mode: ReplayMode, request: Option<u64>) -> anyhow::Result<()> {
    let mut tape = load_tape(path)?;

    if let Some(id) = request {
        let record = tape
            .request(id)
            .with_context(|| format!("Tape 中没有请求 #{}", id))?;
        println!("{}", serde_json::to_string_pretty(record)?);
        return Ok(());
    }

    if let Some(session) = &tape.session {
        println!(
            "会话 {} -> {}  开始于 {}  时长 {}",
            session.listen_addr,
            session.target_url,
            tape.start_time.to_rfc3339(),
            format_offset(tape.duration)
        );
    }

    let speed = match mode {
        ReplayMode::At(percent) => {
            tape.seek_to_percent(percent);
            print_snapshot(&tape);
            return Ok(());
        }
        ReplayMode::Step => {
            step_through(&mut tape, Tape::step_forward);
            return Ok(());
        }
        ReplayMode::StepBackward => {
            tape.seek_to_percent(1.0);
            step_through(&mut tape, Tape::step_backward);
            return Ok(());
        }
        ReplayMode::RealTime(speed) => speed,
    };

    let clock = PlaybackClock::new(tape.start_time, speed);
    println!("实时回放，倍速 {}x（Ctrl-C 结束）", clock.speed());
    let mut seen: HashMap<u64, RequestStatus> = HashMap::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }
        let playing = tape.advance(&clock, Instant::now());
        let offset = format_offset(tape.current_time - tape.start_time);
        for record in tape.current_requests() {
            if seen.insert(record.id, record.status) != Some(record.status) {
                println!("[{}] {}", offset, describe(&record));
            }
        }
        if !playing {
            break;
        }
    }
    Ok(())
}

/// 逐个事件时刻输出快照，直到无法再移动
fn step_through(tape: &mut Tape, step: fn(&mut Tape) -> bool) {
    print_snapshot(tape);
    loop {
        let before = tape.current_time;
        let more = step(tape);
        if tape.current_time == before {
            break;
        }
        let changed: Vec<String> = tape
            .timeline
            .iter()
            .filter(|e| e.time == tape.current_time)
            .map(|e| format!("#{}", e.request_id))
            .collect();
        println!("-- 变更: {}", changed.join(", "));
        print_snapshot(tape);
        if !more {
            break;
        }
    }
}

fn print_snapshot(tape: &Tape) {
    let requests = tape.current_requests();
    println!(
        "== {}  ({:.0}%)  {} 个请求",
        format_offset(tape.current_time - tape.start_time),
        tape.progress() * 100.0,
        requests.len()
    );
    for record in &requests {
        println!("  {}", describe(record));
    }
}

fn describe(record: &RequestRecord) -> String {
    let status = match record.status {
        RequestStatus::Pending => "…".to_string(),
        _ => record.status_code.to_string(),
    };
    format!(
        "#{} {} {} {} {} {:?} tokens={}/{} ${:.6}{}",
        record.id,
        status,
        record.method,
        record.path,
        common::truncate_with_ellipsis(&record.model, 40),
        record.duration,
        record.input_tokens,
        record.output_tokens,
        record.cost,
        if record.cached_response { " (cache)" } else { "" }
    )
}

fn format_offset(delta: chrono::TimeDelta) -> String {
    let millis = delta.num_milliseconds().max(0);
    format!("+{}.{:03}s", millis / 1000, millis % 1000)
}
