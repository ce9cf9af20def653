//! Turn router
//!
//! Decides where the loop goes after a model reply:
//! - ContinueWithTools: the reply requested one or more tool calls
//! - Finish: the reply is the turn's final answer

use crate::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    ContinueWithTools,
    Finish,
}

pub struct TurnRouter;

impl TurnRouter {
    /// Pure: only looks at the message's tool calls.
    pub fn decide(last_message: &Message) -> Route {
        if last_message.has_tool_calls() {
            Route::ContinueWithTools
        } else {
            Route::Finish
        }
    }
}
