use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use gwb_core::platforms::whatsapp::{GraphMediaFetcher, OutboundSender};
use gwb_core::store::{ChangeSet, RecordStore};
use gwb_core::testkit::{FIXTURE_SECRET, RecordingTransport, fixture_gateway};
use gwb_core::{
    Channel, InMemoryStore, Lead, LeadStatus, Message, PhoneField, RecordRef, ThreadRef,
};
use gwb_ingress_whatsapp::{DispatchSettings, Dispatcher, Normalizer, link_message, router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tower::ServiceExt;

const SENDER: &str = "5511999998888";
const UPDATE_PATH: &str = "/gateway/whatsapp/main/update";

struct Fixture {
    store: Arc<InMemoryStore>,
    app: Router,
}

async fn fixture() -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    let mut seed = ChangeSet::new();
    seed.put(fixture_gateway());
    store.commit(seed).await.unwrap();
    let transport = Arc::new(RecordingTransport::new());
    let fetcher = Arc::new(GraphMediaFetcher::new(transport.clone(), "mock://graph"));
    let sender = Arc::new(OutboundSender::new(
        store.clone(),
        transport,
        "mock://graph",
    ));
    let dispatcher = Dispatcher::new(
        store.clone(),
        Normalizer::without_transcoding(fetcher),
        sender,
        DispatchSettings::default(),
    );
    Fixture {
        store,
        app: router(Arc::new(dispatcher)),
    }
}

fn update(messages: Value) -> String {
    json!({"object": "whatsapp_business_account", "entry": [{"changes": [{
        "field": "messages",
        "value": {
            "messaging_product": "whatsapp",
            "contacts": [{"wa_id": SENDER, "profile": {"name": "Ana"}}],
            "messages": messages,
        }
    }]}]})
    .to_string()
}

fn text(id: &str, body: &str) -> Value {
    json!({"id": id, "from": SENDER, "type": "text", "text": {"body": body},
           "timestamp": "1700000000"})
}

fn signed_post(body: &str, secret: &str) -> Request<Body> {
    let signature = security::compute_signature(secret, body.as_bytes()).unwrap();
    Request::builder()
        .method("POST")
        .uri(UPDATE_PATH)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-hub-signature-256", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn deliver(fx: &Fixture, body: &str) {
    let res = fx
        .app
        .clone()
        .oneshot(signed_post(body, FIXTURE_SECRET))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"{}");
}

async fn channel(fx: &Fixture) -> Option<Channel> {
    fx.store.channel("gw-main", SENDER).await.unwrap()
}

async fn thread(fx: &Fixture) -> Vec<Message> {
    let channel = channel(fx).await.expect("channel exists");
    fx.store
        .thread_messages(&ThreadRef::channel(channel.id))
        .await
        .unwrap()
}

async fn stored(fx: &Fixture, provider_id: &str) -> Message {
    let channel = channel(fx).await.expect("channel exists");
    fx.store
        .message_by_provider_ref(&ThreadRef::channel(channel.id), provider_id)
        .await
        .unwrap()
        .expect("message stored")
}

#[tokio::test]
async fn text_message_creates_channel_message_and_contact() {
    let fx = fixture().await;
    deliver(&fx, &update(json!([text("wamid.1", "hello")]))).await;

    let channel = channel(&fx).await.expect("channel exists");
    assert_eq!(channel.name, "Ana");
    let messages = thread(&fx).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "hello");
    assert_eq!(messages[0].provider_message_id.as_deref(), Some("wamid.1"));
    assert!(messages[0].from_webhook);

    let contact = fx
        .store
        .contact_by_phone("+5511999998888")
        .await
        .unwrap()
        .expect("contact created");
    assert_eq!(contact.name, "Ana");
    assert_eq!(contact.whatsapp_field, Some(PhoneField::Mobile));
    let link = fx
        .store
        .identity_link("gw-main", SENDER)
        .await
        .unwrap()
        .expect("identity link");
    assert_eq!(link.contact_id, contact.id);
}

#[tokio::test]
async fn replayed_delivery_is_stored_once() {
    let fx = fixture().await;
    let mut seed = ChangeSet::new();
    seed.put(Lead {
        id: "lead-1".into(),
        name: "Booking".into(),
        mobile: SENDER.into(),
        status: LeadStatus::Draft,
        button_consumed: false,
    });
    fx.store.commit(seed).await.unwrap();

    let body = update(json!([text("wamid.1", "hello")]));
    deliver(&fx, &body).await;
    let first_entry = fx
        .store
        .active_queue_entry(&channel(&fx).await.unwrap().id)
        .await
        .unwrap()
        .expect("queued");
    deliver(&fx, &body).await;

    assert_eq!(thread(&fx).await.len(), 1);
    let entry = fx
        .store
        .active_queue_entry(&channel(&fx).await.unwrap().id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.id, first_entry.id);
    let leads = fx.store.leads_for_mobile("+5511999998888").await.unwrap();
    assert_eq!(leads[0].status, LeadStatus::InProgress);
    assert!(leads[0].button_consumed);
}

#[tokio::test]
async fn distinct_ids_from_one_sender_are_distinct_messages() {
    let fx = fixture().await;
    deliver(&fx, &update(json!([text("wamid.1", "hello")]))).await;
    deliver(&fx, &update(json!([text("wamid.2", "hello")]))).await;
    assert_eq!(thread(&fx).await.len(), 2);
}

#[tokio::test]
async fn status_only_delivery_has_no_effect() {
    let fx = fixture().await;
    let body = json!({"entry": [{"changes": [{"field": "messages", "value": {
        "statuses": [{"id": "wamid.out.1", "status": "read", "recipient_id": SENDER}]
    }}]}]})
    .to_string();
    deliver(&fx, &body).await;
    assert!(channel(&fx).await.is_none());
}

#[tokio::test]
async fn wrong_signature_is_swallowed() {
    let fx = fixture().await;
    let res = fx
        .app
        .clone()
        .oneshot(signed_post(
            &update(json!([text("wamid.1", "hello")])),
            "not-the-secret",
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(!fx.store.message_exists("wamid.1").await.unwrap());
    assert!(channel(&fx).await.is_none());
}

#[tokio::test]
async fn terminal_button_reply_is_stored_but_not_queued() {
    let fx = fixture().await;
    let button = json!({"id": "wamid.btn", "from": SENDER, "type": "button",
        "button": {"payload": "CONFIRMAR", "text": "CONFIRMAR"}, "timestamp": "1700000001"});
    deliver(&fx, &update(json!([button]))).await;

    let messages = thread(&fx).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "CONFIRMAR");
    let channel = channel(&fx).await.unwrap();
    assert!(
        fx.store
            .active_queue_entry(&channel.id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn replies_thread_onto_known_messages_only() {
    let fx = fixture().await;
    deliver(&fx, &update(json!([text("wamid.ABC", "first")]))).await;
    let mut reply = text("wamid.DEF", "second");
    reply["context"] = json!({"id": "wamid.ABC"});
    let mut orphan = text("wamid.GHI", "third");
    orphan["context"] = json!({"id": "wamid.unknown"});
    deliver(&fx, &update(json!([reply]))).await;
    deliver(&fx, &update(json!([orphan]))).await;

    let parent = stored(&fx, "wamid.ABC").await;
    let reply = stored(&fx, "wamid.DEF").await;
    assert_eq!(reply.parent_id.as_deref(), Some(parent.id.as_str()));
    let orphan = stored(&fx, "wamid.GHI").await;
    assert!(orphan.parent_id.is_none());
}

#[tokio::test]
async fn reply_to_linked_message_is_mirrored_onto_the_record() {
    let fx = fixture().await;
    deliver(&fx, &update(json!([text("wamid.1", "hello")]))).await;
    let channel = channel(&fx).await.unwrap();

    let mut outbound = Message::outbound(&channel.id, "Your table is ready", OffsetDateTime::now_utc());
    outbound.provider_message_id = Some("wamid.out.9".into());
    outbound.delivery = None;
    let mut seed = ChangeSet::new();
    seed.put(outbound.clone());
    fx.store.commit(seed).await.unwrap();
    let record = RecordRef {
        model: "crm.lead".into(),
        res_id: "42".into(),
    };
    link_message(fx.store.as_ref(), &outbound.id, record.clone())
        .await
        .unwrap();

    let mut reply = text("wamid.2", "on my way");
    reply["context"] = json!({"id": "wamid.out.9"});
    deliver(&fx, &update(json!([reply]))).await;

    let mirrored = fx
        .store
        .thread_messages(&ThreadRef::Record(record))
        .await
        .unwrap();
    assert_eq!(mirrored.len(), 2);
    assert_eq!(mirrored[0].body, "on my way");
    let reply = stored(&fx, "wamid.2").await;
    assert_eq!(reply.mirror_id.as_deref(), Some(mirrored[0].id.as_str()));
}

#[tokio::test]
async fn handshake_echoes_challenge_only_for_matching_token() {
    let fx = fixture().await;
    let get = |query: &str| {
        Request::builder()
            .uri(format!("{UPDATE_PATH}?{query}"))
            .body(Body::empty())
            .unwrap()
    };

    let res = fx
        .app
        .clone()
        .oneshot(get("hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1158201444"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"1158201444");

    let res = fx
        .app
        .clone()
        .oneshot(get("hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1158201444"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn healthz_is_no_content() {
    let fx = fixture().await;
    let res = fx
        .app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}
