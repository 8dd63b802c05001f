//! Scans for the transfer service and prints every message received.
//!
//! Pass `--restored` to simulate a state-restoration relaunch.

#[cfg(target_vendor = "apple")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use central_restore::{Error, LaunchOptions, MessageConsumer};
    use central_restore_corebluetooth::{CentralHost, ManagerOptions};
    use objc2::MainThreadMarker;
    use objc2_foundation::NSRunLoop;
    use tracing::metadata::LevelFilter;
    use tracing::{info, warn};
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    struct PrintMessages;

    impl MessageConsumer for PrintMessages {
        fn on_message_complete(&mut self, message: &[u8]) {
            info!(message = %String::from_utf8_lossy(message), "received message");
        }

        fn on_error(&mut self, error: &Error) {
            warn!(%error, "lifecycle error");
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let options = ManagerOptions::default();
    let mut launch = LaunchOptions::default();
    if std::env::args().any(|arg| arg == "--restored") {
        launch.bluetooth_centrals.extend(options.restore_identifier.clone());
    }

    let run_loop = unsafe { NSRunLoop::currentRunLoop() };
    let mtm = MainThreadMarker::new().ok_or("must run on the main thread")?;

    let _host = CentralHost::main_thread(&options, &launch, PrintMessages, mtm)?;

    unsafe { run_loop.run() };

    Ok(())
}

#[cfg(not(target_vendor = "apple"))]
fn main() {
    eprintln!("this example requires CoreBluetooth");
}
