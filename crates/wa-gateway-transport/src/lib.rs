pub mod wa_jid;
pub mod wa_pairing;
pub mod wa_webhook;
