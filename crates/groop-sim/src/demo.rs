/// A trip group: one creator, N members joining one by one, M messages
/// each, then every device loads the full history.
use std::time::Instant;

use groop_e2ee::{E2eeConfig, EncryptedMessage, GroupId, StoreOp, UserId};

use crate::report::{expect, timed_step, ScenarioResult, StepResult};
use crate::scenarios::Backend;

pub struct DemoConfig {
    pub members: usize,
    pub messages: usize,
    /// Members who join the group but are never admitted.
    pub outsiders: usize,
}

pub async fn run(config: &E2eeConfig, demo: DemoConfig) -> anyhow::Result<ScenarioResult> {
    let start = Instant::now();
    let mut result = ScenarioResult::new(&format!(
        "demo: {} members, {} messages each, {} not admitted",
        demo.members, demo.messages, demo.outsiders
    ));
    let backend = Backend::new(config.clone());
    let group = GroupId::new();

    let mut members = Vec::with_capacity(demo.members.max(1));
    for i in 0..demo.members.max(1) {
        let user = format!("member-{i}");
        members.push((UserId::from(user.as_str()), backend.device(&user).await?));
    }
    let mut outsiders = Vec::with_capacity(demo.outsiders);
    for i in 0..demo.outsiders {
        outsiders.push(backend.device(&format!("outsider-{i}")).await?);
    }

    let (creator_id, creator) = &members[0];
    result.add(
        timed_step("creator sets up encryption", || async {
            creator
                .key_exchange()
                .setup_groop_encryption(&group, creator_id)
                .await
                .map(|_| group.to_string())
                .map_err(|e| e.to_string())
        })
        .await,
    );

    // Each admitted member admits the next one.
    let mut keyed: Vec<UserId> = vec![creator_id.clone()];
    for pair in members.windows(2) {
        let (admitter_id, admitter) = &pair[0];
        let (joiner_id, joiner) = &pair[1];
        let step = format!("{admitter_id} admits {joiner_id}");
        result.add(
            timed_step(&step, || async {
                admitter
                    .key_exchange()
                    .handle_new_member_joined(&group, joiner_id, &keyed)
                    .await
                    .map_err(|e| e.to_string())?;
                let has = joiner
                    .encryption()
                    .has_groop_key(&group)
                    .await
                    .map_err(|e| e.to_string())?;
                expect(has, format!("{joiner_id} has no key after admission"))
            })
            .await,
        );
        keyed.push(joiner_id.clone());
    }

    let send_start = Instant::now();
    let mut history: Vec<EncryptedMessage> = Vec::new();
    let mut send_error = None;
    'send: for (user_id, session) in &members {
        for n in 0..demo.messages {
            let text = format!("{user_id}: message {n}");
            match session.encryption().encrypt(&group, &text).await {
                Ok(message) => history.push(message),
                Err(e) => {
                    send_error = Some(format!("{user_id}: {e}"));
                    break 'send;
                }
            }
        }
    }
    result.add(StepResult {
        step: "everyone sends".into(),
        ok: send_error.is_none(),
        elapsed_ms: send_start.elapsed().as_secs_f64() * 1000.0,
        detail: Some(send_error.unwrap_or_else(|| format!("{} messages", history.len()))),
    });

    for (user_id, session) in &members {
        let step = format!("{user_id} loads history");
        result.add(
            timed_step(&step, || async {
                let inbound = session.encryption().decrypt_history(&group, &history).await;
                let readable = inbound.iter().filter(|m| m.is_decrypted == Some(true)).count();
                expect(
                    readable == history.len(),
                    format!("{readable}/{} readable", history.len()),
                )
            })
            .await,
        );
    }

    for (i, outsider) in outsiders.iter().enumerate() {
        let step = format!("outsider-{i} sees only locked messages");
        result.add(
            timed_step(&step, || async {
                let inbound = outsider.encryption().decrypt_history(&group, &history).await;
                let locked = inbound.iter().filter(|m| m.is_decrypted == Some(false)).count();
                expect(locked == history.len(), format!("{locked}/{} locked", history.len()))?;
                Ok(format!("state {}", outsider.state(&group)))
            })
            .await,
        );
    }

    result.add(
        timed_step("store traffic", || async {
            Ok(format!(
                "{} envelopes, {} envelope reads, {} directory reads",
                backend.store.envelope_count(&group),
                backend.store.calls(StoreOp::KeyEnvelope),
                backend.store.calls(StoreOp::UserRecord)
            ))
        })
        .await,
    );

    for (_, session) in &members {
        session.shutdown().await;
    }
    result.finalize(start);
    Ok(result)
}
