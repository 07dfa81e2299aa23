// A macro for logging of security events.
// Currently just creates a normal info-level log entry under the "security"
// target. Audit-worthy events (negotiation outcome, issued and evicted
// tokens, replays) go through this macro so that they can be routed to a
// dedicated security log by the logger configuration.
#[macro_export]
macro_rules! security_log {
  ($($arg:tt)*) => (
      {log::info!(target: "security", $($arg)*);}
    )
}
