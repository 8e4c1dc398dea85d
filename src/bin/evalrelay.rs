use anyhow::Result;

fn main() -> Result<()> {
    evalrelay::cli::run()
}
