#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = certificate_registry::run().await {
        eprintln!("certificate-registry fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
