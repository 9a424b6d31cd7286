//! DHT store module
//!
//! Replicates values to the k nodes closest to their key. A node lookup
//! finds those nodes and collects the security tokens they issued; each
//! node then gets a store request carrying its own token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::dht::contact::Contact;
use crate::dht::database::DhtValueEntity;
use crate::dht::future::DhtFuture;
use crate::dht::kuid::Kuid;
use crate::dht::lookup::LookupManager;
use crate::dht::message::{MessageBody, StoreStatusCode, HEADER_LENGTH};
use crate::dht::token::{SecurityToken, MAX_TOKEN_LENGTH};
use crate::error::{DhtError, Result};

/// Outcome of storing values under one key
#[derive(Debug, Clone)]
pub struct StoreResult {
    pub key: Kuid,
    /// Nodes that accepted every value
    pub stored_at: Vec<Contact>,
    /// Nodes that rejected a value, had no token, or did not answer
    pub failed: Vec<Contact>,
    pub elapsed: Duration,
}

impl StoreResult {
    pub fn is_successful(&self) -> bool {
        !self.stored_at.is_empty()
    }
}

/// Split entities into groups that each fit in one store request
fn chunk_entities(entities: Vec<DhtValueEntity>, max_message_size: usize) -> Vec<Vec<DhtValueEntity>> {
    let base = HEADER_LENGTH + 1 + MAX_TOKEN_LENGTH + 2;
    let mut chunks = Vec::new();
    let mut current: Vec<DhtValueEntity> = Vec::new();
    let mut size = base;
    for entity in entities {
        let len = entity.encoded_len();
        if !current.is_empty() && size + len > max_message_size {
            chunks.push(std::mem::take(&mut current));
            size = base;
        }
        size += len;
        current.push(entity);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Map a store response to the error describing what the node refused
fn check_store_response(contact: &Contact, body: MessageBody) -> Result<()> {
    let results = match body {
        MessageBody::StoreResponse {
            status: StoreStatusCode::Success,
            ..
        } => return Ok(()),
        MessageBody::StoreResponse {
            status: StoreStatusCode::InvalidToken,
            ..
        } => {
            return Err(DhtError::security_error_with_address(
                "Store rejected: invalid security token",
                contact.addr.to_string(),
            ));
        }
        MessageBody::StoreResponse { results, .. } => results,
        other => {
            return Err(DhtError::protocol_error_with_source(
                "Unexpected response to store",
                other.opcode().to_string(),
            ));
        }
    };

    let refused: Vec<String> = results
        .iter()
        .filter(|r| r.code != StoreStatusCode::Success)
        .map(|r| format!("{} by {}", r.key.to_hex(), r.creator.to_hex()))
        .collect();
    let field = results
        .iter()
        .find(|r| r.code != StoreStatusCode::Success)
        .map_or_else(|| contact.id.to_hex(), |r| r.key.to_hex());
    Err(DhtError::validation_error_with_field(
        format!(
            "{} refused {} of {} values: {}",
            contact.addr,
            refused.len(),
            results.len(),
            refused.join(", ")
        ),
        field,
    ))
}

async fn store_at(
    lookups: &LookupManager,
    contact: &Contact,
    token: SecurityToken,
    chunks: &[Vec<DhtValueEntity>],
) -> Result<()> {
    let dispatcher = lookups.dispatcher();
    for chunk in chunks {
        let body = MessageBody::StoreRequest {
            token: token.clone(),
            entities: chunk.clone(),
        };
        let response = dispatcher.send_request(contact.addr, Some(contact.id), body).await?;
        check_store_response(contact, response.body)?;
    }
    Ok(())
}

/// Store `entities`, which must all share `key`, at the nodes closest to it
pub fn store(lookups: Arc<LookupManager>, key: Kuid, entities: Vec<DhtValueEntity>) -> DhtFuture<StoreResult> {
    if entities.iter().any(|e| e.key != key) {
        return DhtFuture::ready(Err(DhtError::validation_error_with_field(
            "all values of a store must share its key",
            key.to_hex(),
        )));
    }

    DhtFuture::spawn(async move {
        let started = Instant::now();
        let lookup = lookups.lookup_nodes(key).await?;
        let max_message_size = lookups.dispatcher().settings().max_message_size;
        let chunks = chunk_entities(entities, max_message_size);

        let mut failed = Vec::new();
        let mut targets = Vec::new();
        for contact in &lookup.contacts {
            match lookup.token_for(&contact.id) {
                Some(token) => targets.push((contact.clone(), token.clone())),
                None => {
                    debug!("No security token from {}, skipping store", contact);
                    failed.push(contact.clone());
                }
            }
        }

        let attempts = targets
            .iter()
            .map(|(contact, token)| store_at(&lookups, contact, token.clone(), &chunks));
        let outcomes = join_all(attempts).await;

        let mut stored_at = Vec::new();
        for ((contact, _), outcome) in targets.into_iter().zip(outcomes) {
            match outcome {
                Ok(()) => stored_at.push(contact),
                Err(e) => {
                    warn!("Store of {} at {} failed: {}", key.to_hex(), contact, e);
                    failed.push(contact);
                }
            }
        }

        info!(
            "Stored {} at {} of {} nodes",
            key.to_hex(),
            stored_at.len(),
            lookup.contacts.len()
        );
        Ok(StoreResult {
            key,
            stored_at,
            failed,
            elapsed: started.elapsed(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::database::DhtValueType;
    use crate::dht::message::StoreStatus;

    fn entity(len: usize) -> DhtValueEntity {
        DhtValueEntity::new(
            Kuid::random(),
            "10.0.0.1:6346".parse().unwrap(),
            Kuid::MIN,
            DhtValueType::BINARY,
            vec![0u8; len],
        )
    }

    #[test]
    fn test_chunk_small_values_together() {
        let chunks = chunk_entities(vec![entity(10), entity(10), entity(10)], 8192);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3);
    }

    #[test]
    fn test_chunk_large_values_apart() {
        let chunks = chunk_entities(vec![entity(4000), entity(4000), entity(100)], 8192);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 1);
        assert_eq!(chunks[1].len(), 2);
    }

    #[test]
    fn test_chunk_empty() {
        assert!(chunk_entities(Vec::new(), 8192).is_empty());
    }

    #[test]
    fn test_store_result_success() {
        let result = StoreResult {
            key: Kuid::MIN,
            stored_at: vec![Contact::new(Kuid::random(), "10.0.0.2:1".parse().unwrap())],
            failed: Vec::new(),
            elapsed: Duration::ZERO,
        };
        assert!(result.is_successful());
    }

    #[test]
    fn test_refused_values_named_in_error() {
        let contact = Contact::new(Kuid::random(), "10.0.0.3:6346".parse().unwrap());
        let key = Kuid::hash_of(b"refused");
        let (kept, refused) = (Kuid::random(), Kuid::random());
        let body = MessageBody::StoreResponse {
            status: StoreStatusCode::Failure,
            results: vec![
                StoreStatus {
                    key,
                    creator: kept,
                    code: StoreStatusCode::Success,
                },
                StoreStatus {
                    key,
                    creator: refused,
                    code: StoreStatusCode::Failure,
                },
            ],
        };
        match check_store_response(&contact, body).unwrap_err() {
            DhtError::ValidationError { message, field } => {
                assert!(message.contains("refused 1 of 2 values"));
                assert!(message.contains(&refused.to_hex()));
                assert!(!message.contains(&kept.to_hex()));
                assert_eq!(field, Some(key.to_hex()));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_invalid_token_is_a_security_error() {
        let contact = Contact::new(Kuid::random(), "10.0.0.4:6346".parse().unwrap());
        let body = MessageBody::StoreResponse {
            status: StoreStatusCode::InvalidToken,
            results: Vec::new(),
        };
        assert!(matches!(
            check_store_response(&contact, body),
            Err(DhtError::SecurityError { .. })
        ));

        let accepted = MessageBody::StoreResponse {
            status: StoreStatusCode::Success,
            results: Vec::new(),
        };
        assert!(check_store_response(&contact, accepted).is_ok());
        assert!(check_store_response(&contact, MessageBody::PingRequest).is_err());
    }
}
