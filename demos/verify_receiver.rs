use webhook_engine::{compute_signature, verify_webhook_request, DEFAULT_SIGNATURE_HEADER};

fn main() {
    let secret = b"supersecret";
    let payload = br#"{"taskId":123,"assignee":"ada"}"#;

    // What the engine would have sent.
    let signature = compute_signature(secret, payload);
    let headers = vec![
        ("content-type", "application/json"),
        ("x-webhook-event", "task.completed"),
        ("x-webhook-signature", signature.as_str()),
    ];

    match verify_webhook_request(headers.iter().copied(), payload, secret, DEFAULT_SIGNATURE_HEADER) {
        Ok(()) => println!("signature valid"),
        Err(e) => println!("rejected: {e}"),
    }

    let tampered = br#"{"taskId":124,"assignee":"ada"}"#;
    match verify_webhook_request(headers.iter().copied(), tampered, secret, DEFAULT_SIGNATURE_HEADER) {
        Ok(()) => println!("signature valid"),
        Err(e) => println!("rejected: {e}"),
    }
}
