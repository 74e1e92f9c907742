use super::keys::is_function_owner;
use super::resources::SweptKind;
use super::ControllerInner;

impl ControllerInner {
    /// Enqueues the owning Function of every managed object found in the cluster.
    /// Nothing is deleted here: a key whose Function is gone takes the delete path
    /// when it is reconciled. Returns the number of keys enqueued.
    pub(super) async fn garbage_collect(&self) -> usize {
        tracing::info!("Collecting garbage.");

        let mut enqueued = 0;

        for kind in SweptKind::ALL {
            let objects = match self.call(self.resources.list_owned(kind)).await {
                Ok(objects) => objects,
                Err(error) => {
                    tracing::error!(%kind, %error, "Failed to list objects. Skipping.");
                    continue;
                }
            };

            for object in objects {
                let Some(namespace) = object.namespace else {
                    continue;
                };

                for owner in object
                    .owner_references
                    .iter()
                    .filter(|owner| is_function_owner(owner))
                {
                    let key = format!("{}/{}", namespace, owner.name);
                    tracing::debug!(%kind, name = %object.name, %key, "Enqueuing owner.");

                    self.queue.add(key);
                    enqueued += 1;
                }
            }
        }

        tracing::info!(enqueued, "Garbage collection done.");

        enqueued
    }
}
