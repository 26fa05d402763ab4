//! Relay (forward) dispatch.
//!
//! A query that no local handler executes is matched against the routing
//! table. When the matching instruction points elsewhere, the query is sent
//! on as a new exchange on that destination's line. For duplex requests the
//! relay answers at once with `{q=RELAYED, pickup=<pipe>}` and later serves
//! the real answer from a single-answer endpoint named after the original
//! correlation, where the requester collects it.

use std::sync::Arc;

use pipeauth_core::query::{Query, names, reasons, verbs};
use pipeauth_core::{Destination, EncryptionOperator, Instruction, RoutingTable};

use crate::error::TransportError;
use crate::service::TransportService;
use crate::transport::sanitize_pipe_name;

/// Relays a query may pass through before it is dropped.
pub const MAX_HOPS: u32 = 8;

/// Pipe a relayed answer is served on.
#[must_use]
pub fn pickup_pipe(from: &str, exchange: &str) -> String {
    sanitize_pipe_name(&format!("answer.{from}.{exchange}"))
}

/// Where a query without a local handler goes.
#[derive(Debug)]
pub(crate) enum RouteDecision<'a> {
    /// Treat as targeting this process.
    Local,
    /// Send on according to the instruction.
    Forward(&'a Instruction),
}

pub(crate) fn decide<'a>(routes: &'a RoutingTable, query: &Query, local: &Destination) -> RouteDecision<'a> {
    match routes.match_query(query) {
        Some(instruction) if !points_at(&instruction.destination, local) => RouteDecision::Forward(instruction),
        _ => RouteDecision::Local,
    }
}

fn points_at(destination: &Destination, local: &Destination) -> bool {
    destination.is_local() && local.is_local() && destination.pipe == local.pipe
}

/// Forward `query` per `instruction` and return the answer owed to the
/// original sender.
pub(crate) async fn forward(
    service: &TransportService,
    instruction: Instruction,
    mut query: Query,
    reply_key: Option<Arc<dyn EncryptionOperator>>,
    duplex: bool,
) -> Query {
    let hops = query.hops();
    if hops >= MAX_HOPS {
        tracing::warn!(instruction = %instruction.name, hops, "dropping query: too many hops");
        return Query::error(reasons::HOPS, format!("dropped after {hops} hops"));
    }
    query.set(names::HOPS, (hops + 1).to_string());

    if !duplex {
        tracing::debug!(instruction = %instruction.name, destination = %instruction.destination, "relaying one-way query");
        service.enqueue_via(&instruction, query).await;
        return Query::ack();
    }

    let Some(correlation) = query.correlation() else {
        return Query::error(reasons::RELAY, "relayed request carries no correlation");
    };
    let pickup = pickup_pipe(&correlation.from, &correlation.exchange);
    tracing::debug!(
        instruction = %instruction.name,
        destination = %instruction.destination,
        pickup = %pickup,
        "relaying duplex query"
    );

    let relay = service.clone();
    let pipe = pickup.clone();
    tokio::spawn(async move {
        let answer = match relay.request_via(&instruction, query).await {
            Ok(answer) => answer,
            Err(TransportError::Remote { reason, detail }) => Query::error(&reason, detail),
            Err(e) => {
                tracing::warn!(destination = %instruction.destination, error = %e, "relay failed");
                Query::error(reasons::RELAY, e.to_string())
            }
        };
        if let Err(e) = relay.serve_answer(&pipe, answer, reply_key).await {
            tracing::warn!(pickup = %pipe, error = %e, "could not serve relayed answer");
        }
    });

    Query::verb(verbs::RELAYED).with(names::PICKUP, pickup)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        let mut table = RoutingTable::new();
        table
            .push(
                Instruction::new("self", Destination::local("authority"))
                    .with_patterns(["q=LOCAL"])
                    .unwrap(),
            )
            .unwrap();
        table
            .push(
                Instruction::new("sessions", Destination::local("sessions"))
                    .with_patterns(["q=SESSION"])
                    .unwrap(),
            )
            .unwrap();
        table
    }

    #[test]
    fn test_pickup_pipe_is_deterministic_and_safe() {
        assert_eq!(pickup_pipe("svc", "abc-1"), "answer.svc.abc-1");
        assert_eq!(pickup_pipe("svc", "abc-1"), pickup_pipe("svc", "abc-1"));
        assert_eq!(pickup_pipe("a/b", "x y"), "answer.a_b.x_y");
    }

    #[test]
    fn test_decide_forward_or_local() {
        let table = table();
        let local = Destination::local("authority");

        assert!(matches!(
            decide(&table, &Query::verb("SESSION"), &local),
            RouteDecision::Forward(i) if i.name == "sessions"
        ));
        // Instruction naming this endpoint means local.
        assert!(matches!(
            decide(&table, &Query::verb("LOCAL"), &local),
            RouteDecision::Local
        ));
        // No instruction means local.
        assert!(matches!(
            decide(&table, &Query::verb("OTHER"), &local),
            RouteDecision::Local
        ));
    }

    #[test]
    fn test_localhost_alias_points_at_self() {
        assert!(points_at(
            &Destination::new("localhost", "authority"),
            &Destination::local("authority")
        ));
        assert!(!points_at(
            &Destination::new("remote", "authority"),
            &Destination::local("authority")
        ));
    }
}
