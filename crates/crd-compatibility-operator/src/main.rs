use std::{
    io::{Write, stdout},
    net::SocketAddr,
    sync::Arc,
};

use clap::Parser;
use crd_compatibility::{
    checker::{SchemaCompatibilityChecker, ServedVersionPolicy},
    controller::RequirementStatusController,
    crd::CompatibilityRequirement,
    store::CompatibilityRequirementStore,
    webhooks::{self, CrdValidationWebhook, ObjectPruningWebhook},
};
use kube::{CustomResourceExt, runtime::reflector::store::WriterDropped};
use snafu::{ResultExt, Snafu};

use crate::{
    logging::{LogFormat, initialize_logging},
    signal::SignalWatcher,
};

mod logging;
mod signal;

const LOG_ENV_VAR: &str = "CRD_COMPATIBILITY_LOG";
const DEFAULT_FIELD_MANAGER: &str = "crd-compatibility-operator";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to serialize the CompatibilityRequirement CRD"))]
    SerializeCrd { source: serde_yaml::Error },

    #[snafu(display("failed to write the CompatibilityRequirement CRD to stdout"))]
    WriteCrd { source: std::io::Error },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: kube::Error },

    #[snafu(display("failed to watch for termination signals"))]
    WatchSignals { source: signal::SignalError },

    #[snafu(display("failed to bind webhook server to {bind_address}"))]
    BindWebhookServer {
        source: std::io::Error,
        bind_address: SocketAddr,
    },

    #[snafu(display("the CompatibilityRequirement store was dropped before it became ready"))]
    StoreNotReady { source: WriterDropped },

    #[snafu(display("failed to run webhook server"))]
    RunWebhookServer { source: std::io::Error },
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Eq, clap::Subcommand)]
enum Command {
    /// Print the CompatibilityRequirement CRD.
    Crd,

    /// Run the webhooks and the CompatibilityRequirement status controller.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, clap::Args)]
struct RunArguments {
    /// The address the webhook server listens on.
    #[arg(long, env, default_value = "0.0.0.0:8443")]
    bind_address: SocketAddr,

    /// How versions which are no longer served by a CustomResourceDefinition are reported.
    #[arg(long, env, value_enum, default_value_t)]
    served_version_policy: ServedVersionPolicy,

    /// The format of the log output.
    #[arg(long, env, value_enum, default_value_t)]
    log_format: LogFormat,

    /// The field manager used when applying the status of CompatibilityRequirements.
    #[arg(long, env, default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();

    match opts.command {
        Command::Crd => {
            let crd = serde_yaml::to_string(&CompatibilityRequirement::crd())
                .context(SerializeCrdSnafu)?;
            stdout().write_all(crd.as_bytes()).context(WriteCrdSnafu)
        }
        Command::Run(arguments) => run(arguments).await,
    }
}

async fn run(arguments: RunArguments) -> Result<(), Error> {
    initialize_logging(LOG_ENV_VAR, arguments.log_format);
    tracing::info!(
        served_version_policy = %arguments.served_version_policy,
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let client = kube::Client::try_default()
        .await
        .context(CreateClientSnafu)?;
    let signal_watcher = SignalWatcher::termination().context(WatchSignalsSnafu)?;

    let controller = RequirementStatusController::new(
        client,
        SchemaCompatibilityChecker::with_served_version_policy(arguments.served_version_policy),
        arguments.field_manager,
    );
    let requirements = controller.store();

    let store: Arc<dyn CompatibilityRequirementStore> = Arc::new(requirements.clone());
    let router = webhooks::router(
        Arc::new(CrdValidationWebhook::new(
            store.clone(),
            SchemaCompatibilityChecker::with_served_version_policy(arguments.served_version_policy),
        )),
        Arc::new(ObjectPruningWebhook::new(store)),
    );

    let bind_address = arguments.bind_address;
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(BindWebhookServerSnafu { bind_address })?;

    let webhook_server = async {
        // Validating against an empty store would admit every change
        requirements
            .wait_until_ready()
            .await
            .context(StoreNotReadySnafu)?;

        tracing::info!(%bind_address, "starting webhook server");
        axum::serve(listener, router)
            .with_graceful_shutdown(signal_watcher.handle())
            .await
            .context(RunWebhookServerSnafu)
    };

    let ((), webhook_server) = futures::join!(controller.run(), webhook_server);
    webhook_server
}
