use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or(
        "usage: lexam-server <config.json> [--listen HOST:PORT] [--sqlite PATH] [--redis URL] [--json-logs]",
    )?;

    let mut listen_override: Option<String> = None;
    let mut sqlite_override: Option<String> = None;
    let mut redis_url: Option<String> = None;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--sqlite" => {
                sqlite_override = Some(args.next().ok_or("missing value for --sqlite")?);
            }
            "--redis" => {
                redis_url = Some(args.next().ok_or("missing value for --redis")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    init_tracing(json_logs);

    let raw = std::fs::read_to_string(&path)?;
    let mut config = lexam::AppConfig::from_json_str(&raw)?;
    if let Some(listen) = listen_override {
        config.listen = listen;
    }
    if let Some(sqlite_path) = sqlite_override {
        config.sqlite_path = sqlite_path;
    }
    if redis_url.is_none() {
        redis_url = config.redis_url.clone();
    }

    let store = lexam::SqliteStore::new(&config.sqlite_path);
    store.init().await?;

    let grading = config
        .grading
        .as_ref()
        .ok_or("config missing `grading` section")?;
    let mut grader = lexam::HttpGrader::new(grading.api_key.clone());
    if let Some(base_url) = grading.base_url.as_deref() {
        grader = grader.with_base_url(base_url);
    }
    if let Some(model) = grading.model.as_deref() {
        grader = grader.with_model(model);
    }

    let payments = config
        .payments
        .as_ref()
        .ok_or("config missing `payments` section")?;
    let mut payment_client = lexam::HttpPaymentClient::new(payments.secret_key.clone());
    if let Some(base_url) = payments.base_url.as_deref() {
        payment_client = payment_client.with_base_url(base_url);
    }

    let exams = lexam::ExamService::new(store.clone(), Arc::new(grader));
    let billing = lexam::BillingService::new(store, Arc::new(payment_client), config.packs.clone());

    let mut state = lexam::AppState::new(exams, billing)
        .with_api_keys(config.api_keys.clone())
        .with_webhook_secret(config.webhook_secret.clone())
        .with_limits(config.limits.clone());
    state = attach_redis_limits(state, redis_url)?;

    let app = lexam::http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    println!("lexam-server listening on {}", config.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(feature = "store-redis")]
fn attach_redis_limits(
    state: lexam::AppState,
    redis_url: Option<String>,
) -> Result<lexam::AppState, Box<dyn std::error::Error>> {
    let Some(url) = redis_url else {
        return Ok(state);
    };
    Ok(state.with_redis_limits(lexam::RedisLimitStore::new(url)?))
}

#[cfg(not(feature = "store-redis"))]
fn attach_redis_limits(
    state: lexam::AppState,
    redis_url: Option<String>,
) -> Result<lexam::AppState, Box<dyn std::error::Error>> {
    if redis_url.is_some() {
        return Err("redis rate limits require `--features store-redis`".into());
    }
    Ok(state)
}
