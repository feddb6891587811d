mod agent_loop;
mod dispatch;

pub use agent_loop::*;

#[cfg(test)]
mod tests;
