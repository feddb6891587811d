use anyhow::Result;
use async_trait::async_trait;
use chrono::{Local, Utc};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::tools::TypedTool;

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct CurrentTimeArgs {
    /// Return UTC instead of the local time zone.
    #[serde(default)]
    pub utc: bool,
}

pub struct CurrentTime;

#[async_trait]
impl TypedTool for CurrentTime {
    type Args = CurrentTimeArgs;

    fn name(&self) -> &str {
        "get_current_time"
    }

    fn description(&self) -> &str {
        "Returns the current date and time as an RFC 3339 timestamp. Use it whenever the answer depends on today's date or the current time."
    }

    async fn call(&self, args: CurrentTimeArgs) -> Result<String> {
        Ok(if args.utc {
            Utc::now().to_rfc3339()
        } else {
            Local::now().to_rfc3339()
        })
    }
}
