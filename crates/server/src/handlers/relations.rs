//! Related-identity cards: signed relationship attestations between an
//! issuer and the hosted recipient, capped per application.

use chrono::Utc;
use portico_proto::messages::{
    conversation_response, AddRelatedIdentityRequest, AddRelatedIdentityResponse,
    CardApplicationInformation, GetIdentityRelationshipsInformationRequest,
    GetIdentityRelationshipsInformationResponse, IdentityRelationship, RelationshipCard,
    RemoveRelatedIdentityRequest, RemoveRelatedIdentityResponse, SignedRelationshipCard, Status,
};
use portico_proto::Response;
use portico_storage::{wildcard_to_like, CardOutcome, RelatedIdentityCard};
use prost::Message as ProstMessage;
use tracing::warn;

use crate::dispatch::{HandlerResult, Outcome};
use crate::node::SharedNode;
use crate::session::SessionHandle;

pub const MAX_APPLICATION_ID_BYTES: usize = 32;

fn invalid(details: &str) -> HandlerResult {
    (
        Some(Response::error(Status::InvalidValue, details)),
        Outcome::Continue,
    )
}

fn bad_signature(details: &str) -> HandlerResult {
    (
        Some(Response::error(Status::InvalidSignature, details)),
        Outcome::Continue,
    )
}

/// Identifier of a relationship card: SHA-256 over the card serialized with
/// its `card_id` zeroed.
pub fn card_identifier(card: &RelationshipCard) -> [u8; 32] {
    portico_crypto::sha256(&card.normalized().encode_to_vec())
}

/// `AddRelatedIdentity`: validates the card chain and stores it.
pub async fn handle_add_related_identity(
    node: &SharedNode,
    session: &SessionHandle,
    request: AddRelatedIdentityRequest,
) -> HandlerResult {
    let Some(application) = request.application else {
        return invalid("application");
    };
    let Some(signed_card) = request.signed_card else {
        return invalid("signedCard");
    };
    let Some(card) = signed_card.card.clone() else {
        return invalid("signedCard.card");
    };
    let (public_key, identity_id) = {
        let state = session.state.lock().await;
        (
            state.public_key.clone().unwrap_or_default(),
            state.identity_id.unwrap_or_default(),
        )
    };
    if application.application_id.is_empty()
        || application.application_id.len() > MAX_APPLICATION_ID_BYTES
    {
        return invalid("application.applicationId");
    }
    if card.recipient_public_key != public_key {
        return invalid("signedCard.card.recipientPublicKey");
    }
    if card.issuer_public_key.len() != portico_crypto::PUBLIC_KEY_LEN {
        return invalid("signedCard.card.issuerPublicKey");
    }
    if card.card_version.len() != 3 {
        return invalid("signedCard.card.cardVersion");
    }
    if card.valid_from > card.valid_to {
        return invalid("signedCard.card.validFrom");
    }
    let card_id = card_identifier(&card);
    if card.card_id != card_id {
        return invalid("signedCard.card.cardId");
    }
    if application.card_id != card_id {
        return invalid("application.cardId");
    }
    if portico_crypto::verify_signature(&card.issuer_public_key, &card_id, &signed_card.issuer_signature)
        .is_err()
    {
        return bad_signature("signedCard.issuerSignature");
    }
    if portico_crypto::verify_signature(
        &public_key,
        &application.encode_to_vec(),
        &request.application_signature,
    )
    .is_err()
    {
        return bad_signature("applicationSignature");
    }
    let record = RelatedIdentityCard {
        identity_id,
        application_id: application.application_id.clone(),
        card_id: card.card_id.clone(),
        card_version: card.card_version.clone(),
        issuer_public_key: card.issuer_public_key.clone(),
        recipient_public_key: card.recipient_public_key.clone(),
        card_type: card.card_type.clone(),
        valid_from: card.valid_from,
        valid_to: card.valid_to,
        issuer_signature: signed_card.issuer_signature.clone(),
        recipient_signature: request.application_signature.clone(),
    };
    match node
        .storage
        .add_related_card(&record, node.config.max_identity_relations)
        .await
    {
        Ok(CardOutcome::Added) => (
            Some(Response::conversation_ok(
                conversation_response::Part::AddRelatedIdentity(AddRelatedIdentityResponse {}),
            )),
            Outcome::Continue,
        ),
        Ok(CardOutcome::Duplicate) => (
            Some(Response::error(
                Status::AlreadyExists,
                "application.applicationId",
            )),
            Outcome::Continue,
        ),
        Ok(CardOutcome::QuotaExceeded) => (
            Some(Response::error(Status::QuotaExceeded, "")),
            Outcome::Continue,
        ),
        Err(err) => {
            warn!(error = %err, "related card insert failed");
            (
                Some(Response::error(Status::Internal, "")),
                Outcome::Continue,
            )
        }
    }
}

/// `RemoveRelatedIdentity`: deletes the card for one application.
pub async fn handle_remove_related_identity(
    node: &SharedNode,
    session: &SessionHandle,
    request: RemoveRelatedIdentityRequest,
) -> HandlerResult {
    let identity_id = {
        let state = session.state.lock().await;
        state.identity_id.unwrap_or_default()
    };
    match node
        .storage
        .remove_related_card(&identity_id, &request.application_id)
        .await
    {
        Ok(true) => (
            Some(Response::conversation_ok(
                conversation_response::Part::RemoveRelatedIdentity(
                    RemoveRelatedIdentityResponse {},
                ),
            )),
            Outcome::Continue,
        ),
        Ok(false) => (
            Some(Response::error(Status::NotFound, "application.applicationId")),
            Outcome::Continue,
        ),
        Err(err) => {
            warn!(error = %err, "related card removal failed");
            (
                Some(Response::error(Status::Internal, "")),
                Outcome::Continue,
            )
        }
    }
}

/// `GetIdentityRelationshipsInformation`: matching cards with optional type,
/// issuer and validity filters.
pub async fn handle_get_relationships(
    node: &SharedNode,
    request: GetIdentityRelationshipsInformationRequest,
) -> HandlerResult {
    let Ok(identity_id) = <[u8; 32]>::try_from(request.identity_id.as_slice()) else {
        return invalid("identityNetworkId");
    };
    let issuer = if request.issuer_public_key.is_empty() {
        None
    } else if request.issuer_public_key.len() == portico_crypto::PUBLIC_KEY_LEN {
        Some(request.issuer_public_key.as_slice())
    } else {
        return invalid("issuerPublicKey");
    };
    let type_like = wildcard_to_like(&request.card_type);
    let cards = match node
        .storage
        .list_related_cards(
            &identity_id,
            request.include_invalid,
            Some(type_like.as_str()),
            issuer,
            Utc::now().timestamp_millis(),
        )
        .await
    {
        Ok(cards) => cards,
        Err(err) => {
            warn!(error = %err, "relationship listing failed");
            return (
                Some(Response::error(Status::Internal, "")),
                Outcome::Continue,
            );
        }
    };
    let relationships = cards
        .into_iter()
        .map(|card| IdentityRelationship {
            application: Some(CardApplicationInformation {
                application_id: card.application_id,
                card_id: card.card_id.clone(),
            }),
            application_signature: card.recipient_signature,
            signed_card: Some(SignedRelationshipCard {
                card: Some(RelationshipCard {
                    card_id: card.card_id,
                    card_version: card.card_version,
                    issuer_public_key: card.issuer_public_key,
                    recipient_public_key: card.recipient_public_key,
                    card_type: card.card_type,
                    valid_from: card.valid_from,
                    valid_to: card.valid_to,
                }),
                issuer_signature: card.issuer_signature,
            }),
        })
        .collect();
    (
        Some(Response::conversation_ok(
            conversation_response::Part::GetIdentityRelationshipsInformation(
                GetIdentityRelationshipsInformationResponse { relationships },
            ),
        )),
        Outcome::Continue,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_crypto::IdentityKeyPair;

    fn build_card(issuer: &IdentityKeyPair, recipient: &IdentityKeyPair) -> RelationshipCard {
        let mut card = RelationshipCard {
            card_id: Vec::new(),
            card_version: vec![1, 0, 0],
            issuer_public_key: issuer.public.to_vec(),
            recipient_public_key: recipient.public.to_vec(),
            card_type: "friend".to_string(),
            valid_from: 0,
            valid_to: i64::MAX,
        };
        card.card_id = card_identifier(&card).to_vec();
        card
    }

    #[test]
    fn card_identifier_ignores_existing_id() {
        let issuer = IdentityKeyPair::from_seed(b"issuer-issuer-issuer-issuer-32!!").unwrap();
        let recipient = IdentityKeyPair::from_seed(b"recip-recip-recip-recip-recip-32").unwrap();
        let card = build_card(&issuer, &recipient);
        // Recomputing over the card with its id filled in yields the same
        // digest because the id field is zeroed first.
        assert_eq!(card_identifier(&card).to_vec(), card.card_id);
    }

    #[test]
    fn issuer_signature_over_card_id_verifies() {
        let issuer = IdentityKeyPair::from_seed(b"issuer-issuer-issuer-issuer-32!!").unwrap();
        let recipient = IdentityKeyPair::from_seed(b"recip-recip-recip-recip-recip-32").unwrap();
        let card = build_card(&issuer, &recipient);
        let signature = issuer.sign(&card.card_id);
        portico_crypto::verify_signature(&issuer.public, &card.card_id, &signature).unwrap();
    }
}
