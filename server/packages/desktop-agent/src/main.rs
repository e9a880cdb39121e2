use desktop_agent::cli::run_desktop_agent;

fn main() {
    if let Err(err) = run_desktop_agent() {
        tracing::error!(error = %err, "desktop-agent failed");
        std::process::exit(1);
    }
}
