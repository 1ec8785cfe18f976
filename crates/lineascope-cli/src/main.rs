//! lineascope CLI - stage drivers for the lineage pipeline.

mod cli;
mod config;
mod stages;

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lineascope_graph::{AgeClient, AgeSettings, LineageGraphBuilder, MetadataGraphBuilder};
use lineascope_llm::{
    ContextAssembler, ExtractorSettings, LineageExtractor, LlmSettings, OpenAiCompatClient,
    RateLimiter,
};
use lineascope_store::{
    connect, run_migrations, LogStore, MetadataStore, PatternStore, PoolSettings, RetryPolicy,
};

use cli::{Args, Command};
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Fingerprinting is pure; no config or database needed.
    if let Command::Fingerprint { file } = &args.command {
        return run_fingerprint(file.as_deref());
    }

    let config = Config::from_file(&args.config)?;
    init_tracing(&config.logging.level);

    let app = App::connect(&config).await?;

    match args.command {
        Command::Aggregate => {
            app.aggregate_stage(&config).run().await?;
        }
        Command::Analyze => {
            app.analyze_stage(&config)?.run().await?;
        }
        Command::GraphMetadata => {
            let builder = app.metadata_builder(&config).await?;
            stages::graph::run_metadata(&builder).await?;
        }
        Command::GraphLineage => {
            let builder = app.lineage_builder(&config).await?;
            stages::graph::run_lineage(&builder, config.pipeline.graph_batch_size).await?;
        }
        Command::Run => {
            // One pass over the whole pipeline, in data-flow order. A fresh
            // sweep first so abandoned claims from a dead worker re-enter.
            stages::sweep::run(&app.patterns, config.claim_grace(), false).await?;
            app.aggregate_stage(&config).run().await?;
            app.analyze_stage(&config)?.run().await?;
            let metadata_builder = app.metadata_builder(&config).await?;
            stages::graph::run_metadata(&metadata_builder).await?;
            let lineage_builder = app.lineage_builder(&config).await?;
            stages::graph::run_lineage(&lineage_builder, config.pipeline.graph_batch_size)
                .await?;
        }
        Command::Sweep { reset_failed } => {
            stages::sweep::run(&app.patterns, config.claim_grace(), reset_failed).await?;
        }
        Command::Fingerprint { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Shared handles built once per invocation.
struct App {
    patterns: PatternStore,
    logs: LogStore,
    metadata: MetadataStore,
}

impl App {
    async fn connect(config: &Config) -> Result<Self> {
        let pool = connect(
            &config.control_plane.database_url,
            &PoolSettings {
                max_connections: config.control_plane.max_connections,
                statement_timeout: config.statement_timeout(),
                ..PoolSettings::default()
            },
        )
        .await
        .context("failed to connect to the control-plane database")?;

        run_migrations(&pool)
            .await
            .context("failed to apply control-plane migrations")?;

        Ok(Self {
            patterns: PatternStore::new(pool.clone(), config.pipeline.reanalyze_failed),
            logs: LogStore::new(pool.clone()),
            metadata: MetadataStore::new(pool),
        })
    }

    fn aggregate_stage(&self, config: &Config) -> stages::aggregate::AggregateStage {
        stages::aggregate::AggregateStage {
            patterns: self.patterns.clone(),
            logs: self.logs.clone(),
            metadata: self.metadata.clone(),
            batch_size: config.pipeline.log_batch_size,
            concurrency: config.pipeline.aggregate_concurrency,
            retry: RetryPolicy::exponential(config.pipeline.db_retry_attempts),
        }
    }

    fn analyze_stage(&self, config: &Config) -> Result<stages::analyze::AnalyzeStage> {
        let client = OpenAiCompatClient::new(LlmSettings {
            base_url: config.llm.base_url.clone(),
            api_key: config.llm.api_key.clone(),
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            request_timeout: config.llm_request_timeout(),
        })
        .context("failed to build the LLM client")?;

        let limiter = Arc::new(RateLimiter::new(
            config.llm.requests_per_minute,
            config.llm.tokens_per_minute,
        ));
        let extractor = LineageExtractor::new(
            Arc::new(client),
            limiter,
            ExtractorSettings {
                call_timeout: config.llm_request_timeout(),
                ..ExtractorSettings::default()
            },
        );
        let assembler = ContextAssembler::new(
            self.metadata.clone(),
            config.pipeline.context_budget_chars,
        );

        Ok(stages::analyze::AnalyzeStage {
            patterns: self.patterns.clone(),
            assembler: Arc::new(assembler),
            extractor: Arc::new(extractor),
            batch_size: config.pipeline.analyze_batch_size,
            concurrency: config.llm.max_concurrency,
        })
    }

    async fn age_client(&self, config: &Config) -> Result<AgeClient> {
        AgeClient::connect(&AgeSettings {
            database_url: config.graph.database_url.clone(),
            graph_name: config.graph.graph_name.clone(),
            max_connections: config.graph.max_connections,
            statement_timeout: config.graph_statement_timeout(),
        })
        .await
        .context("failed to connect to the graph database")
    }

    async fn metadata_builder(&self, config: &Config) -> Result<MetadataGraphBuilder> {
        let age = self.age_client(config).await?;
        Ok(MetadataGraphBuilder::new(self.metadata.clone(), age))
    }

    async fn lineage_builder(&self, config: &Config) -> Result<LineageGraphBuilder> {
        let age = self.age_client(config).await?;
        Ok(LineageGraphBuilder::new(
            self.patterns.clone(),
            age,
            RetryPolicy::exponential(config.pipeline.graph_conflict_retries),
        ))
    }
}

fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

fn run_fingerprint(file: Option<&std::path::Path>) -> Result<()> {
    let sql = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read stdin")?;
            buffer
        }
    };

    match lineascope_core::fingerprint(&sql) {
        Ok(fp) => {
            println!("kind:       {}", fp.kind.as_str());
            println!("sql_hash:   {}", fp.sql_hash);
            println!("normalized: {}", fp.normalized_sql);
            Ok(())
        }
        Err(rejected) => {
            eprintln!("rejected ({}): {}", rejected.reason.code(), rejected.detail);
            std::process::exit(1);
        }
    }
}
