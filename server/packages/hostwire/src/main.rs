fn main() {
    if let Err(err) = hostwire::cli::run_hostwire() {
        tracing::error!(error = %err, "hostwire failed");
        std::process::exit(1);
    }
}
