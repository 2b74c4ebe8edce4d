//! Cross-module replay scenarios driven through the scripted engine.

mod replay_scenarios;
