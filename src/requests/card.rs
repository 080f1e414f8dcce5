use serde_json::{json, Value};

use crate::api::ApiRequest;
use crate::requests::extract;

/// Card technology understood by the remote.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CardType {
    /// Card serial number (proximity card).
    #[default]
    Csn,
    Qr,
}

impl CardType {
    fn wire(self) -> Value {
        match self {
            Self::Csn => json!({"id": "0", "type": "1"}),
            Self::Qr => json!({"id": "6", "type": "6"}),
        }
    }
}

/// Registers a card number and returns the created card row.
pub fn create_card(card_no: &str, card_type: CardType) -> ApiRequest<Value> {
    ApiRequest::<Value>::post("/cards")
        .with_json(json!({
            "CardCollection": {
                "rows": [{
                    "card_type": card_type.wire(),
                    "card_id": card_no,
                }]
            }
        }))
        .map_result(|response| extract(&response, "/CardCollection/rows/0"))
}

/// Registers a QR credential.
pub fn create_qr(card_id: &str) -> ApiRequest<Value> {
    create_card(card_id, CardType::Qr)
}

/// Checks whether a card id is already assigned.
pub fn card_registered(card_id: &str) -> ApiRequest<bool> {
    ApiRequest::<Value>::get(format!("/v2/cards/registered/?card_id={card_id}"))
        .map_result(|response| {
            let body: Value = response.json()?;
            Ok(body.get("Card").is_some_and(|card| !card.is_null()))
        })
}
