use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use ai_aggregator::{
    AppError, JobEventPublisher, JobKind, JobService, PricingService, ProviderRegistry,
    config::{Config, LoggingConfig},
    load_config_from,
    store::{InMemoryJobStore, InMemoryPricingStore, InMemoryUsageStore},
};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ai-aggregator", version, about = "Multi-provider AI job runner")]
struct Cli {
    /// Configuration file (environment variables prefixed AI_AGG_ override it)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job to completion and print the result
    Run {
        #[arg(long, value_enum, default_value_t = KindArg::Text)]
        kind: KindArg,
        /// Provider to use; repeat for an ordered fallback list
        #[arg(short, long = "provider")]
        providers: Vec<String>,
        /// Stream text as it arrives (single provider only)
        #[arg(long)]
        stream: bool,
        input: String,
    },
    /// Probe availability of every configured provider
    Providers,
    /// List models from providers that support listing
    Models,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Text,
    Image,
}

impl From<KindArg> for JobKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Text => JobKind::Text,
            KindArg::Image => JobKind::Image,
        }
    }
}

/// 主函数 - 任务调度核心的命令行入口
///
/// 负责加载配置、初始化日志系统，组装注册表、定价服务和通知发布器后执行子命令
#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    // 加载配置文件和环境变量配置
    let config = load_config_from(&cli.config)
        .map_err(|e| AppError::ConfigError(format!("加载配置失败: {:#}", e)))?;

    init_tracing(&config.logging)?;

    tracing::info!(
        config = %cli.config.display(),
        providers_count = config.providers.len(),
        "Configuration loaded successfully"
    );

    let pricing = Arc::new(PricingService::new(Arc::new(InMemoryPricingStore::new())));
    let registry = Arc::new(ProviderRegistry::from_config(&config, Some(pricing))?);

    match cli.command {
        Command::Run {
            kind,
            providers,
            stream,
            input,
        } => run_job(&config, registry, kind.into(), providers, stream, &input).await,
        Command::Providers => {
            let availability = registry.availability_all().await;
            for name in registry.provider_names().await {
                let status = match availability.get(&name) {
                    Some(true) => "available",
                    _ => "unavailable",
                };
                println!("{name}\t{status}");
            }
            Ok(())
        }
        Command::Models => {
            for model in registry.list_all_models().await {
                println!("{}\t{}", model.id, model.owned_by);
            }
            Ok(())
        }
    }
}

async fn run_job(
    config: &Config,
    registry: Arc<ProviderRegistry>,
    kind: JobKind,
    providers: Vec<String>,
    stream: bool,
    input: &str,
) -> Result<(), AppError> {
    let publisher = Arc::new(JobEventPublisher::new(&config.notifications));
    publisher.start().await;

    let service = JobService::new(
        Arc::new(InMemoryJobStore::new()),
        Arc::new(InMemoryUsageStore::new()),
        registry,
        publisher.clone(),
        &config.jobs,
    );
    let tenant_id = Uuid::new_v4();

    let job = match (stream, providers.as_slice()) {
        (true, [provider]) => {
            let job = service.create_job(tenant_id, kind, input).await?;
            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c.cancel();
                }
            });

            let mut out = ChunkWriter::new(std::io::stdout());
            let job = service
                .stream_job(job.id, provider, cancel, &mut |chunk: &str| out.forward(chunk))
                .await?;
            out.forward("\n");
            job
        }
        (true, _) => {
            return Err(AppError::ValidationError(
                "--stream needs exactly one --provider".to_string(),
            ));
        }
        (false, _) => {
            let (job, handle) = service.submit_job(tenant_id, kind, input, providers).await?;
            if let Err(e) = handle.await {
                tracing::error!(job_id = %job.id, error = %e, "job task panicked");
            }
            service.get_job(tenant_id, job.id).await?
        }
    };

    publisher.stop().await;

    match (&job.result, &job.error) {
        (Some(result), _) if !stream => println!("{result}"),
        (_, Some(error)) => eprintln!("job {} failed: {}", job.id, error),
        _ => {}
    }
    tracing::info!(
        job_id = %job.id,
        status = %job.status,
        provider = ?job.provider,
        tokens_in = job.tokens_in,
        tokens_out = job.tokens_out,
        cost = job.cost,
        "job finished"
    );

    Ok(())
}

/// Forwards streamed text to a writer until the first write error, which is
/// logged once. The job keeps running after the reader goes away.
struct ChunkWriter<W> {
    out: W,
    closed: bool,
}

impl<W: Write> ChunkWriter<W> {
    fn new(out: W) -> Self {
        Self { out, closed: false }
    }

    fn forward(&mut self, chunk: &str) {
        if self.closed {
            return;
        }
        let written = self
            .out
            .write_all(chunk.as_bytes())
            .and_then(|()| self.out.flush());
        if let Err(e) = written {
            tracing::warn!(error = %e, "output closed, no longer forwarding chunks");
            self.closed = true;
        }
    }
}

/// 初始化结构化日志系统
///
/// 配置tracing和tracing-subscriber，支持：
/// - 环境变量（RUST_LOG）优先，其次使用配置中的日志级别
/// - json / pretty / compact 三种输出格式
fn init_tracing(logging: &LoggingConfig) -> Result<(), AppError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ai_aggregator={}", logging.level)));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match logging.format.as_str() {
        "pretty" => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        "compact" => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        _ => registry
            .with(
                fmt::layer()
                    .with_target(true) // 显示模块路径
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .try_init(),
    };

    result.map_err(|e| AppError::ConfigError(format!("Failed to initialize tracing: {}", e)))?;

    tracing::debug!("Structured logging system initialized");
    Ok(())
}
