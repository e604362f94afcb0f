mod app;
mod config;
mod dispatch;
mod error;
mod extract;
mod gateway;
mod persist;
mod phone;
mod routing;
mod store;
#[cfg(test)]
mod testing;
mod types;

#[tokio::main]
async fn main() {
    if let Err(err) = app::run().await {
        tracing::error!(error = %err, "ticket router failed to start");
        eprintln!("ticket-router: {err}");
        std::process::exit(1);
    }
}
