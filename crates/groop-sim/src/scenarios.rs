/// The four reference scenarios, run against the in-memory store.
use std::sync::Arc;
use std::time::Instant;

use groop_e2ee::{
    E2eeConfig, E2eeError, E2eeSession, GroupId, MemoryDocumentStore, MemorySecureStorage,
    StoreOp, UserId,
};

use crate::report::{expect, timed_step, ScenarioResult};

/// One shared backend, one session per simulated device.
pub struct Backend {
    pub store: MemoryDocumentStore,
    config: E2eeConfig,
}

impl Backend {
    pub fn new(config: E2eeConfig) -> Self {
        Self {
            store: MemoryDocumentStore::new(),
            config,
        }
    }

    /// Sign `user` in on a fresh device.
    pub async fn device(&self, user: &str) -> anyhow::Result<E2eeSession> {
        self.store.register_user(user, true);
        let session = E2eeSession::start(
            self.config.clone(),
            user,
            Arc::new(self.store.clone()),
            Arc::new(MemorySecureStorage::new()),
        )
        .await?;
        tracing::debug!("device for {user} started");
        Ok(session)
    }
}

fn err(e: E2eeError) -> String {
    e.to_string()
}

fn uid(user: &str) -> UserId {
    UserId::from(user)
}

pub async fn run_all(config: &E2eeConfig) -> anyhow::Result<Vec<ScenarioResult>> {
    Ok(vec![
        scenario_a(config).await?,
        scenario_b(config).await?,
        scenario_c(config).await?,
        scenario_d(config).await?,
    ])
}

/// A: the creator is the only keyholder.
async fn scenario_a(config: &E2eeConfig) -> anyhow::Result<ScenarioResult> {
    let start = Instant::now();
    let mut result = ScenarioResult::new("A: creator only");
    let backend = Backend::new(config.clone());
    let alice = backend.device("A").await?;
    let bob = backend.device("B").await?;
    let g1 = GroupId::from("G1");

    result.add(
        timed_step("A sets up encryption", || async {
            alice
                .key_exchange()
                .setup_groop_encryption(&g1, &uid("A"))
                .await
                .map(|_| String::new())
                .map_err(err)
        })
        .await,
    );
    result.add(
        timed_step("A has the key", || async {
            let has = alice.encryption().has_groop_key(&g1).await.map_err(err)?;
            expect(has, "A has no key")
        })
        .await,
    );
    result.add(
        timed_step("B has no key", || async {
            let has = bob.encryption().has_groop_key(&g1).await.map_err(err)?;
            expect(!has, "B unexpectedly holds the key")?;
            Ok(bob.state(&g1).to_string())
        })
        .await,
    );

    result.finalize(start);
    Ok(result)
}

/// B: an admitted member reads what the creator sends.
async fn scenario_b(config: &E2eeConfig) -> anyhow::Result<ScenarioResult> {
    let start = Instant::now();
    let mut result = ScenarioResult::new("B: admit member");
    let backend = Backend::new(config.clone());
    let alice = backend.device("A").await?;
    let bob = backend.device("B").await?;
    let g1 = GroupId::from("G1");

    result.add(
        timed_step("A sets up encryption", || async {
            alice
                .key_exchange()
                .setup_groop_encryption(&g1, &uid("A"))
                .await
                .map(|_| String::new())
                .map_err(err)
        })
        .await,
    );
    result.add(
        timed_step("A admits B", || async {
            alice
                .key_exchange()
                .handle_new_member_joined(&g1, &uid("B"), &[uid("A")])
                .await
                .map(|_| String::new())
                .map_err(err)
        })
        .await,
    );
    result.add(
        timed_step("B resolves the key", || async {
            let has = bob.encryption().has_groop_key(&g1).await.map_err(err)?;
            expect(has, "B still has no key")
        })
        .await,
    );
    result.add(
        timed_step("B reads A's message", || async {
            let message = alice
                .encryption()
                .encrypt(&g1, "meet at the station")
                .await
                .map_err(err)?;
            let decrypted = bob.encryption().decrypt(&g1, &message).await;
            expect(decrypted.success, "decryption failed")?;
            Ok(decrypted.text)
        })
        .await,
    );

    result.finalize(start);
    Ok(result)
}

/// C: a device without the key cannot admit anyone.
async fn scenario_c(config: &E2eeConfig) -> anyhow::Result<ScenarioResult> {
    let start = Instant::now();
    let mut result = ScenarioResult::new("C: keyless admission");
    let backend = Backend::new(config.clone());
    let alice = backend.device("A").await?;
    let carol = backend.device("C").await?;
    backend.device("D").await?;
    let g1 = GroupId::from("G1");

    result.add(
        timed_step("A sets up encryption", || async {
            alice
                .key_exchange()
                .setup_groop_encryption(&g1, &uid("A"))
                .await
                .map(|_| String::new())
                .map_err(err)
        })
        .await,
    );
    let writes_before = backend.store.calls(StoreOp::WriteKeyEnvelope);
    result.add(
        timed_step("C cannot admit D", || async {
            match carol
                .key_exchange()
                .handle_new_member_joined(&g1, &uid("D"), &[uid("A"), uid("C")])
                .await
            {
                Err(e @ E2eeError::KeyUnavailableLocally { .. }) => Ok(e.to_string()),
                Err(e) => Err(format!("unexpected error: {e}")),
                Ok(()) => Err("admission succeeded without a key".into()),
            }
        })
        .await,
    );
    result.add(
        timed_step("no envelope written", || async {
            expect(
                backend.store.calls(StoreOp::WriteKeyEnvelope) == writes_before
                    && backend.store.envelope_count(&g1) == 1,
                "store changed",
            )
        })
        .await,
    );

    result.finalize(start);
    Ok(result)
}

/// D: epoch 0 history stays readable.
async fn scenario_d(config: &E2eeConfig) -> anyhow::Result<ScenarioResult> {
    let start = Instant::now();
    let mut result = ScenarioResult::new("D: epoch 0 history");
    let backend = Backend::new(config.clone());
    let alice = backend.device("A").await?;
    let bob = backend.device("B").await?;
    let g1 = GroupId::from("G1");

    alice
        .key_exchange()
        .setup_groop_encryption(&g1, &uid("A"))
        .await?;
    let m1 = alice.encryption().encrypt(&g1, "m1").await?;
    alice
        .key_exchange()
        .handle_new_member_joined(&g1, &uid("B"), &[uid("A")])
        .await?;
    alice
        .key_exchange()
        .setup_groop_encryption(&g1, &uid("A"))
        .await?;

    for (name, session) in [("A", &alice), ("B", &bob)] {
        session.leave_group(&g1);
        let step = format!("{name} reads m1 after restart");
        result.add(
            timed_step(&step, || async {
                let history = session
                    .encryption()
                    .decrypt_history(&g1, std::slice::from_ref(&m1))
                    .await;
                let text = history.first().map(|m| m.display_text().to_string());
                expect(text.as_deref() == Some("m1"), format!("got {text:?}"))
            })
            .await,
        );
    }

    result.finalize(start);
    Ok(result)
}
