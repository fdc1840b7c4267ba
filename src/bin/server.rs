use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use warp::hyper::server::conn::Http;
use warp::hyper::service::service_fn;
use warp::hyper::{Body, Request, Response};

use lsat_gateway::authenticator::Authenticator;
use lsat_gateway::challenger::{Challenger, LndChallenger};
use lsat_gateway::config::Config;
use lsat_gateway::context::Context;
use lsat_gateway::freebie::FreebieStore;
use lsat_gateway::kvstore::SledStore;
use lsat_gateway::lightning::LndClient;
use lsat_gateway::mint::Mint;
use lsat_gateway::router::Router;
use lsat_gateway::secretstore::SledSecretStore;
use lsat_gateway::tls::build_server_config;
use lsat_gateway::tor::{AddOnionRequest, ControlPortClient, OnionVersion, TorController};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(EnvFilter::from_default_env())
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Startup order per SPEC_FULL.md §5: config -> SecretStore ->
    // Challenger.Start -> Mint -> Authenticator -> Router -> listeners.
    let config: Config = config::Config::builder()
        .add_source(config::File::with_name("config"))
        .add_source(config::Environment::with_prefix("APP"))
        .build()
        .expect("problem building the config")
        .try_deserialize()
        .expect("problem deserializing config");
    info!(?config, "configuration loaded on startup");

    let services: Vec<_> = config
        .services
        .clone()
        .into_iter()
        .map(|raw| raw.compile())
        .collect::<Result<_, _>>()
        .expect("invalid service configuration");

    let kv = SledStore::open(&config.data_dir).expect("failed to open data store");
    let secrets = Arc::new(SledSecretStore::new(&kv));

    let lnd_client = Arc::new(
        LndClient::connect(
            config.lnd.host.clone(),
            config.lnd.tls_path.clone(),
            config.lnd.mac_path.clone(),
        )
        .await
        .expect("failed to connect to lnd"),
    );
    let challenger: Arc<dyn Challenger> = Arc::new(LndChallenger::new(lnd_client));
    challenger
        .start()
        .await
        .expect("failed to start lightning settlement subscription");

    let mint = Mint::new(secrets, challenger.clone());
    let freebies = FreebieStore::with_mirror(Box::new(kv.clone()));
    let authenticator = Authenticator::new(mint, freebies);

    let static_root = config.static_files.as_ref().map(|s| PathBuf::from(&s.root));
    let router = Arc::new(
        Router::new(services, authenticator, static_root).expect("failed to build router"),
    );

    let ctx = Context::production();

    let main_tls = match &config.server.tls {
        Some(tls) => Some(
            build_server_config(tls, std::path::Path::new(&config.data_dir), &ctx)
                .await
                .expect("failed to provision TLS for the client-facing listener"),
        ),
        None => None,
    };

    let main_addr = SocketAddr::new(config.server.host, config.server.port);
    let mut listeners = vec![tokio::spawn(serve(
        main_addr,
        router.clone(),
        ctx.clone(),
        main_tls,
        false,
    ))];

    if let Some(tor) = config.tor.clone() {
        // Tor listeners accept cleartext HTTP/2, per SPEC_FULL.md §6/§9a,
        // and inherit the same Router (so the same LSAT checks apply —
        // onion traffic is never exempted).
        let tor_addr = SocketAddr::new(config.server.host, tor.listen_port);
        listeners.push(tokio::spawn(serve(
            tor_addr,
            router.clone(),
            ctx.clone(),
            None,
            true,
        )));
        spawn_onion_publisher(tor, &ctx);
    }

    tokio::spawn(await_shutdown_signal(ctx.clone()));

    for listener in listeners {
        if let Err(e) = listener.await {
            error!(error = %e, "listener task panicked");
        }
    }

    info!("listeners drained, stopping challenger");
    challenger.stop().await;
    info!("clean shutdown");
    Ok(())
}

/// Accept loop for one listener: plain TCP, or TLS when `tls` is set.
/// Every accepted connection is served against the same immutable
/// `Router`, stopping once `ctx`'s shutdown token fires (SPEC_FULL.md §5
/// "drains listeners first").
async fn serve(
    addr: SocketAddr,
    router: Arc<Router>,
    ctx: Context,
    tls: Option<Arc<ServerConfig>>,
    http2_only: bool,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listener");
            return;
        }
    };
    info!(%addr, tls = tls.is_some(), "listening");
    let shutdown = ctx.shutdown_token();
    let acceptor = tls.map(TlsAcceptor::from);

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(%addr, "listener shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(%addr, error = %e, "accept failed");
                    continue;
                }
            },
        };

        let router = router.clone();
        let ctx = ctx.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let client_ip = peer_addr.ip();
            let svc = service_fn(move |req: Request<Body>| {
                let router = router.clone();
                let ctx = ctx.clone();
                async move { Ok::<_, std::convert::Infallible>(route(router, req, client_ip, ctx).await) }
            });

            let mut http = Http::new();
            http.http2_only(http2_only);

            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => http.serve_connection(tls_stream, svc).await,
                    Err(e) => {
                        debug!(%peer_addr, error = %e, "tls handshake failed");
                        return;
                    }
                },
                None => http.serve_connection(stream, svc).await,
            };
            if let Err(e) = result {
                debug!(%peer_addr, error = %e, "connection error");
            }
        });
    }
}

async fn route(
    router: Arc<Router>,
    req: Request<Body>,
    client_ip: std::net::IpAddr,
    ctx: Context,
) -> Response<Body> {
    router.route(req, client_ip, &ctx).await
}

/// Drives the explicit shutdown `CancellationToken` from `SIGINT`/`SIGTERM`,
/// replacing the ambient signal handling the teacher's bootstrap used
/// (SPEC_FULL.md §9a).
async fn await_shutdown_signal(ctx: Context) {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received, draining listeners");
    ctx.begin_shutdown();
}

fn spawn_onion_publisher(tor: lsat_gateway::config::TorConfig, ctx: &Context) {
    let shutdown = ctx.shutdown_token();
    tokio::spawn(async move {
        let client = ControlPortClient::new(tor.control_addr.clone());
        let version = if tor.v3 { OnionVersion::V3 } else { OnionVersion::V2 };
        let result = tokio::select! {
            r = client.add_onion(AddOnionRequest {
                version,
                virtual_port: tor.virtual_port,
                target_port: tor.listen_port,
            }) => r,
            _ = shutdown.cancelled() => return,
        };
        match result {
            Ok(addr) => info!(onion_address = %addr, "published onion service"),
            Err(e) => warn!(error = %e, "failed to publish onion service"),
        }
    });
}
