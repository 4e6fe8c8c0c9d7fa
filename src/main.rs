use anyhow::Context as _;

fn main() -> anyhow::Result<()> {
    let code = tradebot::run().context("tradebot failed")?;
    std::process::exit(code);
}
