use vortex::shell::{self, EngineConfig};

fn main() {
    vortex::logging::init_logging();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(config_error) => {
            eprintln!("fatal: {config_error}");
            std::process::exit(shell::EXIT_INIT_FAILURE);
        }
    };

    let exit_code = shell::run(config);
    std::process::exit(exit_code);
}
