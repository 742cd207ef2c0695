use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use pressyard::api::AdminState;
use pressyard::config::{Conf, ConfHandle};
use pressyard::cookie::CookieCodec;
use pressyard::git::GitState;
use pressyard::identity::{DynOwnershipResolver, HttpResolver, InProcessResolver};
use pressyard::listener::HttpListener;
use pressyard::log::LoggerGuard;
use pressyard::render::RenderContext;
use pressyard::session::{DynSessionStore, MemorySessionStore, RedisSessionStore};
use pressyard::userstore::MemoryUserStore;
use pressyard::worker::WorkerTask;
use pressyard_task::{Shutdown, ShutdownSignal, TaskHandle};
use tap::prelude::*;
use tokio::runtime::{self, Runtime};
use work_queue::{DynQueue, MemoryQueue, RedisQueue, RedisQueueOptions};

#[allow(clippy::large_enum_variant)]
enum ServiceState {
    Stopped,
    Running { shutdown: Shutdown, runtime: Runtime },
}

pub struct PressyardService {
    conf_handle: ConfHandle,
    state: ServiceState,
    _logger_guard: LoggerGuard,
}

impl PressyardService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard =
            pressyard::log::init(&conf.log_file, conf.log_directive.as_deref()).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        Ok(Self {
            conf_handle,
            state: ServiceState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create the async runtime")?;

        let conf_handle = self.conf_handle.clone();

        // spawn_tasks binds the listener socket, so it runs on the runtime.
        let tasks = runtime.block_on(spawn_tasks(conf_handle))?;

        trace!("Tasks created");

        let mut join_all =
            futures::future::select_all(tasks.inner.into_iter().map(|handle| Box::pin(handle.finished())));

        runtime.spawn(async {
            loop {
                let ((name, result), _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!(task = name, "Task terminated gracefully"),
                    Ok(Err(error)) => error!(task = name, error = format!("{error:#}"), "Task failed"),
                    Err(error) => error!(task = name, %error, "Task panicked or was cancelled"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = ServiceState::Running {
            shutdown: tasks.shutdown,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("Attempted to stop the service, but it's already stopped");
            }
            ServiceState::Running { shutdown, runtime } => {
                info!("Stopping the service");

                shutdown.signal();

                runtime.block_on(async move {
                    tokio::select! {
                        () = shutdown.drained() => {
                            debug!("All tasks closed gracefully");
                        }
                        () = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("Some tasks didn't terminate in time");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = ServiceState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<TaskHandle<anyhow::Result<()>>>,
    shutdown: Shutdown,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown, shutdown_signal) = Shutdown::new();

        Self {
            inner: Vec::new(),
            shutdown,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: pressyard_task::Task<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = pressyard_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(handle);
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let conf = conf_handle.get_conf();

    let redis_client = conf
        .redis_url
        .as_deref()
        .map(redis::Client::open)
        .transpose()
        .context("invalid Redis URL")?;

    let queue = make_queue(&conf, redis_client.clone()).await?;

    let admin_state = if conf.roles.admin {
        let cookie_codec = CookieCodec::new(&conf.cookie_sign_key, &conf.cookie_encrypt_key)
            .context("failed to build the cookie codec")?
            .pipe(Arc::new);

        let sessions: DynSessionStore = match redis_client {
            Some(client) => Arc::new(
                RedisSessionStore::connect(client)
                    .await
                    .context("failed to create the session store")?,
            ),
            None => Arc::new(MemorySessionStore::new()),
        };

        Some(AdminState {
            cookie_codec,
            sessions,
            users: Arc::new(MemoryUserStore::new()),
        })
    } else {
        None
    };

    let resolver: DynOwnershipResolver = match &admin_state {
        Some(admin) => Arc::new(InProcessResolver::new(
            Arc::clone(&admin.cookie_codec),
            Arc::clone(&admin.sessions),
            Arc::clone(&admin.users),
        )),
        None => Arc::new(HttpResolver::new(conf.admin_url.as_str())?),
    };

    let git_state = conf.roles.git.then(|| GitState {
        repository_base: conf.repository_base.clone(),
        resolver: Arc::clone(&resolver),
        queue: Arc::clone(&queue),
    });

    let mut tasks = Tasks::new();

    if admin_state.is_some() || git_state.is_some() {
        let blog_output_dir = (conf.roles.worker && conf.blog_output_url.scheme() == "file")
            .then(|| conf.blog_output_url.to_file_path().ok())
            .flatten()
            .and_then(|path| camino::Utf8PathBuf::from_path_buf(path).ok());

        let router = pressyard::make_http_service(admin_state, git_state, blog_output_dir);

        let listener = HttpListener::init_and_bind(conf.listen_address, router)
            .await
            .context("failed to initialize the HTTP listener")?;

        tasks.register(listener);
    }

    if conf.roles.worker {
        let blob_store = pressyard::blob::open_store(&conf.blog_output_url)?;

        tasks.register(WorkerTask {
            queue,
            render_ctx: RenderContext {
                admin_url: conf.admin_url.clone(),
                git_server_url: conf.git_server_url.clone(),
                work_dir: conf.work_dir.clone(),
                theme_repository_url: conf.theme_repository_url.clone(),
                renderer: conf.renderer.clone(),
                resolver,
                blob_store,
            },
        });
    }

    Ok(tasks)
}

async fn make_queue(conf: &Conf, redis_client: Option<redis::Client>) -> anyhow::Result<DynQueue> {
    match redis_client {
        Some(client) => {
            // The grooming lease is released by expiry after shutdown; see
            // DESIGN.md.
            let queue = RedisQueue::connect(RedisQueueOptions::builder().client(client).build())
                .await
                .context("failed to create the Redis work queue")?;

            info!(hostname = %conf.hostname, "Using the Redis work queue");

            Ok(Arc::new(queue))
        }
        None => Ok(Arc::new(MemoryQueue::new())),
    }
}
