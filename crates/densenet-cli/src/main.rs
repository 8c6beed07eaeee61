use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    densenet_cli::cli()
}
