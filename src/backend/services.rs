//! Built-in demo services served by the backend binary.

use serde_json::{json, Map, Value};

use crate::backend::dispatcher::MethodRegistry;
use crate::shaping::FieldKind;

pub const TRAVEL_SERVICE: &str = "TravelService";
pub const REVIEW_SERVICE: &str = "ReviewService";

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn send_client_data(fields: &Map<String, Value>) -> Map<String, Value> {
    let msg = fields.get("Msg").and_then(Value::as_str).unwrap_or_default();
    object(json!({
        "Msg": format!("Post request recieved, the message sent was {}", msg),
    }))
}

fn retrieve_client_data(fields: &Map<String, Value>) -> Map<String, Value> {
    let user_id = fields.get("userID").cloned().unwrap_or(Value::Null);
    object(json!({
        "VisitedCountries": ["Taiwan", "Singapore", "Malaysia", "Japan"],
        "Name": "Ryan",
        "userID": user_id,
    }))
}

fn get_all_travel_destinations(_fields: &Map<String, Value>) -> Map<String, Value> {
    object(json!({
        "Destinations": ["Myammar", "Japan", "Sweden", "Netherlands"],
    }))
}

fn review_action(action: &str) -> Map<String, Value> {
    object(json!({ "action": format!("{} was successfully uploaded", action) }))
}

fn send_review(_fields: &Map<String, Value>) -> Map<String, Value> {
    review_action("Review Upload")
}

fn edit_review(_fields: &Map<String, Value>) -> Map<String, Value> {
    review_action("Review Edit")
}

fn delete_review(_fields: &Map<String, Value>) -> Map<String, Value> {
    review_action("Review Deletion")
}

pub fn travel_service() -> MethodRegistry {
    MethodRegistry::new(TRAVEL_SERVICE)
        .method("SendClientData", &[("Msg", FieldKind::String)], send_client_data)
        .method(
            "RetrieveClientData",
            &[("userID", FieldKind::Integer)],
            retrieve_client_data,
        )
        .method("GetAllTravelDestinations", &[], get_all_travel_destinations)
}

pub fn review_service() -> MethodRegistry {
    MethodRegistry::new(REVIEW_SERVICE)
        .method("sendReview", &[], send_review)
        .method("editReview", &[], edit_review)
        .method("deleteReview", &[], delete_review)
}

/// Handler table of a built-in service, if one exists under that name
pub fn builtin_registry(service: &str) -> Option<MethodRegistry> {
    match service {
        TRAVEL_SERVICE => Some(travel_service()),
        REVIEW_SERVICE => Some(review_service()),
        _ => None,
    }
}
