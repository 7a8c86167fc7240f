use apikit::config::AppConfig;
use apikit::error::{Code, Data, Error};
use apikit::i18n::I18n;
use apikit::limit::{Limit, LimitConfig, LimitType};
use apikit::listener::EchoListener;
use apikit::observability;
use apikit::repository::{Entity, MemoryRepository, Repository};
use apikit::request::RequestContext;
use apikit::router::{handler, require_auth, Controller, DispatchTable, Route};
use apikit::server;
use apikit::store::{CounterStore, MemoryStore};
use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const SESSION_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

#[tokio::main]
async fn main() {
    if let Err(message) = run().await {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = AppConfig::load_from_file(&config_path)
        .map_err(|err| format!("failed to load config `{config_path}`: {err}"))?;

    observability::init_tracing(&config.logging)?;

    let i18n = I18n::load_dir(&config.i18n_dir)
        .map_err(|err| format!("failed to load i18n dir `{}`: {err}", config.i18n_dir))?;

    let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
    let users = Arc::new(MemoryRepository::<UserRecord>::new());

    let mut dispatch = DispatchTable::new();
    dispatch.register("", session_controllers(users, store.clone()))?;

    let pipeline = server::build_pipeline(
        &config,
        store,
        Arc::new(i18n),
        Arc::new(EchoListener::new()),
        dispatch,
    );

    server::run_server(Arc::new(config), Arc::new(pipeline)).await
}

fn parse_config_path(args: &[String]) -> Result<String, String> {
    match args {
        [flag, path] if flag == "--config" => Ok(path.clone()),
        _ => Err(format!("invalid arguments.\n{}", usage_line())),
    }
}

fn print_usage() {
    println!("{}", usage_line());
}

fn usage_line() -> &'static str {
    "Usage: apikit --config <path-to-config.yaml>"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    id: String,
    name: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl Entity for UserRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    name: String,
}

/// Demo session controllers: login by name issues a token; logout and me
/// sit behind the auth middleware.
fn session_controllers(
    users: Arc<MemoryRepository<UserRecord>>,
    store: Arc<dyn CounterStore>,
) -> Vec<Controller> {
    let login_users = users.clone();
    // Name limits have no ambient key, so this one is applied inside the
    // handler with the submitted name as the key.
    let name_limit = Limit::new(
        store.clone(),
        LimitConfig {
            limit_type: LimitType::Name,
            max_times: 3,
            interval: Duration::from_secs(60),
        },
    );
    let login = Route {
        method: Method::POST,
        path: "/login".to_string(),
        limits: vec![Limit::new(
            store,
            LimitConfig {
                limit_type: LimitType::Ip,
                max_times: 5,
                interval: Duration::from_secs(60),
            },
        )],
        handler: handler(move |ctx: Arc<RequestContext>| {
            let users = login_users.clone();
            let name_limit = name_limit.clone();
            async move {
                let params: LoginParams = ctx.bind()?;
                if params.name.trim().is_empty() {
                    return Err(Error::with_message(
                        Code::ParameterError,
                        "`name` must not be empty",
                    ));
                }

                let allowed = name_limit.add(&params.name).await.map_err(|err| {
                    Error::with_message(Code::ThirdPartyError, err.to_string())
                })?;
                if !allowed {
                    return Err(Error::new(Code::RateLimit));
                }

                let existing = users
                    .find_one(&|user: &UserRecord| user.name == params.name)
                    .await?;
                let user = match existing {
                    Some(user) => user,
                    None => {
                        users
                            .save(UserRecord {
                                id: uuid::Uuid::now_v7().to_string(),
                                name: params.name.clone(),
                                created_at: chrono::Utc::now(),
                            })
                            .await?
                    }
                };

                ctx.set_user_id(&user.id, SESSION_MAX_AGE).await?;
                Ok(Some(Data::new(json!({ "userId": user.id }))))
            }
        }),
    };

    let logout = Route {
        method: Method::POST,
        path: "/logout".to_string(),
        limits: Vec::new(),
        handler: handler(|ctx: Arc<RequestContext>| async move {
            ctx.delete_user_id().await?;
            Ok(None)
        }),
    };

    let me_users = users;
    let me = Route {
        method: Method::GET,
        path: "/me".to_string(),
        limits: Vec::new(),
        handler: handler(move |ctx: Arc<RequestContext>| {
            let users = me_users.clone();
            async move {
                let user_id = ctx.must_user_id().await?;
                let user = users
                    .find_by_id(&user_id)
                    .await?
                    .ok_or_else(|| Error::new(Code::NotFound))?;
                Ok(Some(Data::new(user)))
            }
        }),
    };

    vec![
        Controller {
            path: "/session".to_string(),
            middleware: None,
            routes: vec![login],
        },
        Controller {
            path: "/session".to_string(),
            middleware: Some(require_auth()),
            routes: vec![logout, me],
        },
    ]
}
