use anyhow::{bail, Context, Result};

#[derive(Clone, Debug)]
pub struct DemoConfig {
    pub height: usize,
}

impl DemoConfig {
    pub fn from_env() -> Result<Self> {
        let height = match std::env::var("SMT_HEIGHT") {
            Ok(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("SMT_HEIGHT must be an integer, got {raw:?}"))?,
            Err(_) => 8,
        };

        // The numeric scenario writes index 2.
        if !(2..=smt::MAX_HEIGHT).contains(&height) {
            bail!("SMT_HEIGHT must be within [2, {}]", smt::MAX_HEIGHT);
        }

        Ok(Self { height })
    }
}
