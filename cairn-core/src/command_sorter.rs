//! Orders executable commands by dependency, with drops inverted.

use std::cmp::Ordering;

use crate::change::Change;
use crate::change_type::{ChangeTypeRegistry, STATICDATA};
use crate::command::ExecuteCommand;
use crate::error::Result;
use crate::graph::enricher::GraphEnricher;
use crate::graph::sorter;

/// Sorts executable commands: drops first, then adds, then static data.
pub struct CommandSorter<'a> {
    registry: &'a ChangeTypeRegistry,
    enricher: GraphEnricher,
}

fn phase(command: &ExecuteCommand, lead: &Change) -> u8 {
    if command.drop {
        0
    } else if lead.change_type() == STATICDATA {
        2
    } else {
        1
    }
}

/// The change a command is ordered by; the smallest key for parallel batches.
fn lead(command: &ExecuteCommand) -> Option<&Change> {
    command.changes().iter().min_by_key(|c| c.change_key())
}

impl<'a> CommandSorter<'a> {
    pub fn new(registry: &'a ChangeTypeRegistry, enricher: GraphEnricher) -> Self {
        Self { registry, enricher }
    }

    fn compare<'c>(&self, a: &'c ExecuteCommand, b: &'c ExecuteCommand) -> Ordering {
        let (Some(lead_a), Some(lead_b)) = (lead(a), lead(b)) else {
            return a.changes().len().cmp(&b.changes().len());
        };

        let phase_a = phase(a, lead_a);
        let phase_b = phase(b, lead_b);
        if phase_a != phase_b {
            return phase_a.cmp(&phase_b);
        }

        let key = |change: &'c Change| {
            (
                self.registry.priority(change.change_type()),
                change.order,
                change.schema(),
                change.object_name(),
                change.order_within_object(),
                change.change_name(),
                change.change_type(),
            )
        };
        let ordering = key(lead_a).cmp(&key(lead_b));
        if phase_a == 0 {
            ordering.reverse()
        } else {
            ordering
        }
    }

    /// Order `commands` so that every dependency runs before its dependents,
    /// except that a dropped object goes only after everything depending on it.
    pub fn sort(&self, commands: Vec<ExecuteCommand>, rollback: bool) -> Result<Vec<ExecuteCommand>> {
        if commands.len() < 2 {
            return Ok(commands);
        }

        let mut graph = self.enricher.create_dependency_graph(commands, rollback)?;
        graph.reverse_edges_into(|command| command.drop);

        let order = sorter::sort_with(&graph, |a, b| self.compare(a, b))?;
        let mut slots: Vec<Option<ExecuteCommand>> = graph.into_nodes().into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|id| slots[id].take()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::CodeDependency;
    use crate::change_type::{SP, TABLE, VIEW};

    fn deploy(change: Change) -> ExecuteCommand {
        ExecuteCommand::deploy(change, "")
    }

    fn names(commands: &[ExecuteCommand]) -> Vec<String> {
        commands
            .iter()
            .map(|c| {
                let change = &c.changes()[0];
                format!("{}.{}", change.object_name(), change.change_name())
            })
            .collect()
    }

    fn sort(commands: Vec<ExecuteCommand>) -> Vec<ExecuteCommand> {
        let registry = ChangeTypeRegistry::postgres();
        CommandSorter::new(&registry, GraphEnricher::default())
            .sort(commands, false)
            .unwrap()
    }

    #[test]
    fn test_priority_then_dependencies() {
        let table = Change::incremental("s", TABLE, "orders", "init", 0, "");
        let view = Change::rerunnable("s", VIEW, "v_orders", "")
            .with_dependencies(vec![CodeDependency::discovered("orders")]);
        let sp = Change::rerunnable("s", SP, "sp_a", "");
        let data = Change::rerunnable("s", STATICDATA, "codes", "");

        let sorted = sort(vec![deploy(data), deploy(sp), deploy(view), deploy(table)]);
        assert_eq!(names(&sorted), vec!["orders.init", "v_orders.n/a", "sp_a.n/a", "codes.n/a"]);
    }

    #[test]
    fn test_dependency_beats_priority() {
        // a view used by a function must exist first, despite the lower priority
        let view = Change::rerunnable("s", VIEW, "v_base", "");
        let function = Change::rerunnable("s", "FUNCTION", "f_uses_view", "")
            .with_dependencies(vec![CodeDependency::explicit("v_base")]);
        let sorted = sort(vec![deploy(function), deploy(view)]);
        assert_eq!(names(&sorted), vec!["v_base.n/a", "f_uses_view.n/a"]);
    }

    #[test]
    fn test_drops_run_first_in_reverse_dependency_order() {
        let table = Change::rerunnable("s", VIEW, "v_base", "");
        let dependent = Change::rerunnable("s", VIEW, "v_top", "")
            .with_dependencies(vec![CodeDependency::discovered("v_base")]);
        let added = Change::incremental("s", TABLE, "fresh", "init", 0, "");

        let sorted = sort(vec![
            ExecuteCommand::drop_object(table, true),
            deploy(added),
            ExecuteCommand::drop_object(dependent, true),
        ]);
        assert_eq!(names(&sorted), vec!["v_top.n/a", "v_base.n/a", "fresh.init"]);
    }

    #[test]
    fn test_drop_phase_orders_descending() {
        let a = Change::rerunnable("s", SP, "sp_a", "");
        let b = Change::rerunnable("s", SP, "sp_b", "");
        let t = Change::incremental("s", TABLE, "tab", "drop", 0, "").with_drop(true);
        let sorted = sort(vec![
            ExecuteCommand::drop_object(a, true),
            ExecuteCommand::drop_object(t, true),
            ExecuteCommand::drop_object(b, true),
        ]);
        assert_eq!(names(&sorted), vec!["sp_b.n/a", "sp_a.n/a", "tab.drop"]);
    }

    #[test]
    fn test_incremental_order_and_deploy_order() {
        let c1 = Change::incremental("s", TABLE, "tab", "c1", 0, "");
        let c2 = Change::incremental("s", TABLE, "tab", "c2", 1, "");
        let early = Change::incremental("s", TABLE, "zzz", "init", 0, "").with_order(100);
        let sorted = sort(vec![deploy(c2), deploy(c1), deploy(early)]);
        assert_eq!(names(&sorted), vec!["zzz.init", "tab.c1", "tab.c2"]);
    }

    #[test]
    fn test_sort_is_insertion_order_independent() {
        let build = || {
            vec![
                deploy(Change::incremental("s", TABLE, "a", "c1", 0, "")),
                deploy(Change::incremental("s", TABLE, "a", "c2", 1, "")),
                deploy(Change::rerunnable("s", VIEW, "v", "").with_dependencies(vec![CodeDependency::discovered("a")])),
                deploy(Change::rerunnable("s", SP, "p", "").with_dependencies(vec![CodeDependency::discovered("v")])),
                ExecuteCommand::drop_object(Change::rerunnable("s", VIEW, "old", ""), true),
                deploy(Change::rerunnable("s", STATICDATA, "a_data", "")),
            ]
        };
        let expected = names(&sort(build()));
        for seed in [3u64, 17, 2024] {
            let mut commands = build();
            fastrand::Rng::with_seed(seed).shuffle(&mut commands);
            assert_eq!(names(&sort(commands)), expected, "seed {}", seed);
        }
    }
}
