//! Event printer: one line per event, human-readable or JSON lines.

use clap::ValueEnum;
use keel_core::client::DryRunStrategy;
use keel_core::event::{ApplyOperation, DeleteOperation, Event, PruneOperation, WaitOperation};
use keel_core::stats::Stats;
use serde::Serialize;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output {
    Human,
    Json,
}

pub struct Printer {
    output: Output,
    dry_run: DryRunStrategy,
    show_status: bool,
}

#[derive(Serialize)]
struct Summary<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    stats: &'a Stats,
}

impl Printer {
    pub fn new(output: Output, dry_run: DryRunStrategy, show_status: bool) -> Self { Self { output, dry_run, show_status } }

    fn suffix(&self) -> &'static str {
        match self.dry_run {
            DryRunStrategy::None => "",
            DryRunStrategy::Client => " (dry-run)",
            DryRunStrategy::Server => " (server dry-run)",
        }
    }

    /// Rendered line for `ev`, `None` when the event prints nothing.
    pub fn line(&self, ev: &Event) -> Option<String> {
        if self.output == Output::Json {
            if matches!(ev, Event::Status(_)) && !self.show_status {
                return None;
            }
            return serde_json::to_string(ev).ok();
        }
        let sfx = self.suffix();
        match ev {
            Event::Init(_) => None,
            Event::Apply(e) => Some(match (&e.error, e.operation) {
                (Some(err), _) => format!("{} apply failed: {err}", e.identifier.short()),
                (None, op) => format!("{} {}{sfx}", e.identifier.short(), apply_verb(op)),
            }),
            Event::Prune(e) => Some(match (&e.error, e.operation) {
                (Some(err), _) => format!("{} prune failed: {err}", e.identifier.short()),
                (None, PruneOperation::Skipped) => {
                    format!("{} prune skipped: {}", e.identifier.short(), e.reason.as_deref().unwrap_or("filtered"))
                }
                (None, _) => format!("{} pruned{sfx}", e.identifier.short()),
            }),
            Event::Delete(e) => Some(match (&e.error, e.operation) {
                (Some(err), _) => format!("{} delete failed: {err}", e.identifier.short()),
                (None, DeleteOperation::Skipped) => {
                    format!("{} delete skipped: {}", e.identifier.short(), e.reason.as_deref().unwrap_or("filtered"))
                }
                (None, _) => format!("{} deleted{sfx}", e.identifier.short()),
            }),
            Event::Wait(e) => wait_verb(e.operation).map(|v| format!("{} {v}", e.identifier.short())),
            Event::Status(e) if self.show_status => Some(match &e.resource.message {
                Some(msg) if !msg.is_empty() => format!("{} is {}: {msg}", e.identifier.short(), e.resource.status),
                _ => format!("{} is {}", e.identifier.short(), e.resource.status),
            }),
            Event::Status(_) => None,
            Event::Validation(e) => {
                let ids: Vec<String> = e.identifiers.iter().map(|id| id.short()).collect();
                Some(format!("invalid object(s) {}: {}", ids.join(", "), e.error))
            }
            Event::Error(e) => Some(format!("error: {}", e.error)),
        }
    }

    pub fn print(&self, ev: &Event) {
        if let Some(line) = self.line(ev) {
            println!("{line}");
        }
    }

    pub fn summary(&self, stats: &Stats) -> String {
        match self.output {
            Output::Human => format!("{stats}"),
            Output::Json => serde_json::to_string(&Summary { kind: "summary", stats }).unwrap_or_default(),
        }
    }
}

fn apply_verb(op: ApplyOperation) -> &'static str {
    match op {
        ApplyOperation::Created => "created",
        ApplyOperation::Unchanged => "unchanged",
        ApplyOperation::Configured => "configured",
        ApplyOperation::ServerSideApplied => "serverside-applied",
        ApplyOperation::Unspecified => "apply pending",
    }
}

fn wait_verb(op: WaitOperation) -> Option<&'static str> {
    match op {
        WaitOperation::Pending => None,
        WaitOperation::Reconciled => Some("reconciled"),
        WaitOperation::ReconcileSkipped => Some("reconcile skipped"),
        WaitOperation::ReconcileTimeout => Some("reconcile timeout"),
        WaitOperation::ReconcileFailed => Some("reconcile failed"),
        WaitOperation::Cancelled => Some("reconcile cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::event::{ApplyEvent, ErrorEvent, PruneEvent, StatusEvent, WaitEvent};
    use keel_core::object::ObjectIdentifier;
    use keel_core::status::{ResourceStatus, Status};

    fn deployment() -> ObjectIdentifier { ObjectIdentifier::new("apps", "Deployment", "bar", "foo") }

    fn apply(op: ApplyOperation, error: Option<&str>) -> Event {
        Event::Apply(ApplyEvent { group_name: "apply-1".into(), identifier: deployment(), operation: op, error: error.map(String::from) })
    }

    #[test]
    fn human_lines() {
        let p = Printer::new(Output::Human, DryRunStrategy::None, false);
        assert_eq!(p.line(&apply(ApplyOperation::Created, None)).as_deref(), Some("deployment.apps/foo created"));
        assert_eq!(p.line(&apply(ApplyOperation::Unspecified, Some("boom"))).as_deref(), Some("deployment.apps/foo apply failed: boom"));
        let skipped = Event::Prune(PruneEvent {
            group_name: "prune-1".into(),
            identifier: deployment(),
            operation: PruneOperation::Skipped,
            reason: Some("PreventRemoveFilter: annotation prevents deletion".into()),
            error: None,
        });
        assert_eq!(
            p.line(&skipped).as_deref(),
            Some("deployment.apps/foo prune skipped: PreventRemoveFilter: annotation prevents deletion")
        );
        let pending = Event::Wait(WaitEvent { group_name: "wait-1".into(), identifier: deployment(), operation: WaitOperation::Pending });
        assert_eq!(p.line(&pending), None);
        assert_eq!(p.line(&Event::Error(ErrorEvent { error: "run cancelled".into() })).as_deref(), Some("error: run cancelled"));
    }

    #[test]
    fn dry_run_suffix_and_status_toggle() {
        let p = Printer::new(Output::Human, DryRunStrategy::Server, true);
        assert_eq!(p.line(&apply(ApplyOperation::Configured, None)).as_deref(), Some("deployment.apps/foo configured (server dry-run)"));
        let status = Event::Status(StatusEvent {
            identifier: deployment(),
            resource: ResourceStatus::new(deployment(), Status::InProgress).with_message("updated replicas 0/2"),
        });
        assert_eq!(p.line(&status).as_deref(), Some("deployment.apps/foo is InProgress: updated replicas 0/2"));
        assert_eq!(Printer::new(Output::Human, DryRunStrategy::None, false).line(&status), None);
    }

    #[test]
    fn json_lines_carry_the_event_type() {
        let p = Printer::new(Output::Json, DryRunStrategy::None, false);
        let line = p.line(&apply(ApplyOperation::Created, None)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "apply");
        assert_eq!(v["operation"], "Created");
        let summary: serde_json::Value = serde_json::from_str(&p.summary(&Stats::default())).unwrap();
        assert_eq!(summary["type"], "summary");
    }
}
