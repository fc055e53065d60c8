use std::{process, sync::Arc};

use canopy::{
    application::{
        catalog::CategoryTreeService,
        error::AppError,
        jobs::TokioJobRunner,
        repos::NodeStore,
        tree::TreeQueryEngine,
    },
    cache::{CacheTrigger, CategoryCache, ChangeNotifier, DebounceScheduler, MemoryStore},
    config,
    infra::{db::PostgresNodeStore, error::InfraError, telemetry},
};
use serde::Serialize;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(source = report.source, error = %report, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(source = report.source, error = %report, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let context = build_application_context(&settings).await?;
    let result = match cli_args.command {
        config::Command::Tree(args) => {
            let forest = context.catalog.query_tree(args.active_only).await?;
            print_json(&forest)
        }
        config::Command::Breadcrumbs(args) => {
            let chain = context
                .catalog
                .query_breadcrumbs(args.id)
                .await?
                .ok_or(AppError::NotFound(args.id))?;
            print_json(&chain)
        }
        config::Command::Stats => {
            let stats = context.catalog.query_depth_statistics().await?;
            print_json(&stats)
        }
        config::Command::WarmCache(args) => {
            let report = context
                .catalog
                .warm_cache(args.active_only, args.dry_run)
                .await?;
            info!(
                target = "canopy::warm_cache",
                entries = report.entries,
                hits = report.hits,
                misses = report.misses,
                dry_run = report.dry_run,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "warm-cache finished"
            );
            Ok(())
        }
    };

    context.runner.wait_idle().await;
    result
}

struct ApplicationContext {
    catalog: CategoryTreeService,
    runner: Arc<TokioJobRunner>,
}

async fn build_application_context(
    settings: &config::Settings,
) -> Result<ApplicationContext, AppError> {
    let nodes = init_node_store(settings).await?;
    let nodes: Arc<dyn NodeStore> = nodes;

    let cache_config = settings.cache_config();
    let store = Arc::new(MemoryStore::new(&cache_config));
    let cache = Arc::new(CategoryCache::new(cache_config.clone(), store.clone()));

    let runner = Arc::new(TokioJobRunner::new(cache.clone()));
    let scheduler = DebounceScheduler::new(
        store,
        runner.clone(),
        cache_config.namespace.clone(),
        cache_config.debounce_window(),
    );
    let trigger = Arc::new(CacheTrigger::new(
        cache_config,
        ChangeNotifier::new(nodes.clone()),
        scheduler,
    ));

    let catalog = CategoryTreeService::new(TreeQueryEngine::new(nodes), cache)
        .with_cache_trigger_opt(Some(trigger));

    Ok(ApplicationContext { catalog, runner })
}

async fn init_node_store(settings: &config::Settings) -> Result<Arc<PostgresNodeStore>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PostgresNodeStore::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresNodeStore::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    let store = PostgresNodeStore::new(pool);
    store
        .health_check()
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Arc::new(store))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
