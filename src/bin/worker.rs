#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = certificate_registry::run_worker().await {
        eprintln!("certificate-registry-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
