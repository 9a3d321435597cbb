use crate::{
    config_entry::{ConfigEntry, ConfigEntryKey, ConfigEntryKind},
    CatalogService, Client, CompiledDiscoveryChain, DiscoveryTarget, KvPair, MeshError, Namespace,
    Peering, QueryMeta, QueryOptions,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// An in-process implementation of the mesh client, used by tests and the
/// dev runtime. Blocking queries are woken by any state mutation.
#[derive(Default)]
pub struct LocalClient {
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    entries: BTreeMap<ConfigEntryKey, ConfigEntry>,
    catalog: Vec<CatalogService>,
    namespaces: BTreeSet<Namespace>,
    peerings: BTreeMap<String, Peering>,
    kv: BTreeMap<String, Vec<u8>>,
    chains: BTreeMap<(Namespace, String), CompiledDiscoveryChain>,
    index: u64,
    sets: u64,
    deletes: u64,
    fail_sets: u64,
    fail_after_sets: Option<u64>,
    ops: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            entries: Default::default(),
            catalog: Default::default(),
            namespaces: Default::default(),
            peerings: Default::default(),
            kv: Default::default(),
            chains: Default::default(),
            // Raft-style indexes start at 1 so that the first mutation is
            // observable by a blocking query.
            index: 1,
            sets: 0,
            deletes: 0,
            fail_sets: 0,
            fail_after_sets: None,
            ops: Vec::new(),
        }
    }
}

impl LocalClient {
    pub fn register_service(&self, service: CatalogService) {
        let mut state = self.state.lock();
        state.namespaces.insert(service.namespace.clone());
        state.catalog.retain(|s| {
            s.name != service.name || s.namespace != service.namespace
        });
        state.catalog.push(service);
        state.touch();
        self.notify.notify_waiters();
    }

    pub fn set_peering(&self, peering: Peering) {
        let mut state = self.state.lock();
        state.peerings.insert(peering.name.clone(), peering);
        state.touch();
    }

    /// Pins the compiled chain for a service, overriding compilation from
    /// config entries.
    pub fn set_chain(&self, service: &str, namespace: Namespace, chain: CompiledDiscoveryChain) {
        let mut state = self.state.lock();
        state.chains.insert((namespace, service.to_string()), chain);
        state.touch();
        self.notify.notify_waiters();
    }

    pub fn entry(
        &self,
        kind: ConfigEntryKind,
        namespace: &Namespace,
        name: &str,
    ) -> Option<ConfigEntry> {
        self.state
            .lock()
            .entries
            .get(&ConfigEntryKey {
                kind,
                namespace: namespace.clone(),
                name: name.to_string(),
            })
            .cloned()
    }

    pub fn entries(&self) -> Vec<ConfigEntry> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// The number of config-entry sets and deletes observed so far.
    pub fn op_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.sets, state.deletes)
    }

    /// Makes the next `n` config-entry sets fail with an API error.
    pub fn fail_next_sets(&self, n: u64) {
        self.state.lock().fail_sets = n;
    }

    /// Lets the next `n` config-entry sets through, then fails the one after.
    pub fn fail_set_after(&self, n: u64) {
        self.state.lock().fail_after_sets = Some(n);
    }

    /// Every config-entry mutation observed so far, in order, as
    /// `"<op> <kind> <name>"` strings.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().ops.clear();
    }
}

impl State {
    fn touch(&mut self) {
        self.index += 1;
    }

    fn chain_for(&self, service: &str, namespace: &Namespace) -> CompiledDiscoveryChain {
        if let Some(chain) = self
            .chains
            .get(&(namespace.clone(), service.to_string()))
        {
            return chain.clone();
        }
        self.compile_chain(service, namespace)
    }

    /// Walks routers and splitters from the entry service down to concrete
    /// targets, approximating the mesh's chain compiler.
    fn compile_chain(&self, service: &str, namespace: &Namespace) -> CompiledDiscoveryChain {
        let mut targets = BTreeMap::new();
        let mut stack = vec![(service.to_string(), namespace.clone())];
        let mut seen = BTreeSet::new();

        while let Some((name, ns)) = stack.pop() {
            if !seen.insert((name.clone(), ns.clone())) {
                continue;
            }
            let router = self.entries.get(&ConfigEntryKey {
                kind: ConfigEntryKind::ServiceRouter,
                namespace: ns.clone(),
                name: name.clone(),
            });
            if let Some(ConfigEntry::ServiceRouter(router)) = router {
                for route in &router.routes {
                    if let Some(destination) = &route.destination {
                        let dest_ns = destination.namespace.clone().or_else(|| ns.clone());
                        stack.push((destination.service.clone(), dest_ns));
                    }
                }
                continue;
            }
            let splitter = self.entries.get(&ConfigEntryKey {
                kind: ConfigEntryKind::ServiceSplitter,
                namespace: ns.clone(),
                name: name.clone(),
            });
            if let Some(ConfigEntry::ServiceSplitter(splitter)) = splitter {
                for split in &splitter.splits {
                    let split_ns = split.namespace.clone().or_else(|| ns.clone());
                    stack.push((split.service.clone(), split_ns));
                }
                continue;
            }
            let id = match &ns {
                Some(ns) => format!("{name}.{ns}"),
                None => format!("{name}.default"),
            };
            targets.insert(
                id,
                DiscoveryTarget {
                    service: name,
                    namespace: ns,
                },
            );
        }

        CompiledDiscoveryChain {
            service_name: service.to_string(),
            namespace: namespace.clone(),
            targets,
        }
    }
}

#[async_trait::async_trait]
impl Client for LocalClient {
    async fn set_config_entry(
        &self,
        token: &CancellationToken,
        entry: ConfigEntry,
    ) -> Result<(), MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let mut state = self.state.lock();
        if state.fail_sets > 0 {
            state.fail_sets -= 1;
            return Err(MeshError::Api("injected set failure".to_string()));
        }
        if let Some(remaining) = state.fail_after_sets {
            if remaining == 0 {
                state.fail_after_sets = None;
                return Err(MeshError::Api("injected set failure".to_string()));
            }
            state.fail_after_sets = Some(remaining - 1);
        }
        state.sets += 1;
        let op = format!("set {} {}", entry.kind(), entry.name());
        state.ops.push(op);
        state.entries.insert(entry.key(), entry);
        state.touch();
        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete_config_entry(
        &self,
        token: &CancellationToken,
        kind: ConfigEntryKind,
        namespace: &Namespace,
        name: &str,
    ) -> Result<(), MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let mut state = self.state.lock();
        state.deletes += 1;
        state.ops.push(format!("delete {kind} {name}"));
        state.entries.remove(&ConfigEntryKey {
            kind,
            namespace: namespace.clone(),
            name: name.to_string(),
        });
        state.touch();
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get_config_entry(
        &self,
        token: &CancellationToken,
        kind: ConfigEntryKind,
        namespace: &Namespace,
        name: &str,
    ) -> Result<Option<ConfigEntry>, MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        Ok(self.entry(kind, namespace, name))
    }

    async fn namespaces(&self, token: &CancellationToken) -> Result<Vec<Namespace>, MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let state = self.state.lock();
        if state.namespaces.is_empty() {
            return Ok(vec![None]);
        }
        Ok(state.namespaces.iter().cloned().collect())
    }

    async fn catalog_services(
        &self,
        token: &CancellationToken,
        namespace: &Namespace,
    ) -> Result<Vec<CatalogService>, MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        Ok(self
            .state
            .lock()
            .catalog
            .iter()
            .filter(|s| &s.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn read_peering(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<Option<Peering>, MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        Ok(self.state.lock().peerings.get(name).cloned())
    }

    async fn discovery_chain(
        &self,
        token: &CancellationToken,
        service: &str,
        namespace: &Namespace,
        options: QueryOptions,
    ) -> Result<(CompiledDiscoveryChain, QueryMeta), MeshError> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                let last_index = state.index;
                if options.wait_index == 0 || last_index > options.wait_index {
                    return Ok((state.chain_for(service, namespace), QueryMeta { last_index }));
                }
            }
            tokio::select! {
                _ = token.cancelled() => return Err(MeshError::Cancelled),
                _ = tokio::time::sleep(options.wait_time) => {
                    let state = self.state.lock();
                    let last_index = state.index;
                    return Ok((state.chain_for(service, namespace), QueryMeta { last_index }));
                }
                _ = notified => {}
            }
        }
    }

    async fn kv_get(
        &self,
        token: &CancellationToken,
        key: &str,
    ) -> Result<Option<Vec<u8>>, MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        Ok(self.state.lock().kv.get(key).cloned())
    }

    async fn kv_list(
        &self,
        token: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<KvPair>, MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        Ok(self
            .state
            .lock()
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn kv_txn_set(
        &self,
        token: &CancellationToken,
        pairs: Vec<KvPair>,
    ) -> Result<(), MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let mut state = self.state.lock();
        for pair in pairs {
            state.kv.insert(pair.key, pair.value);
        }
        state.touch();
        self.notify.notify_waiters();
        Ok(())
    }

    async fn kv_delete(&self, token: &CancellationToken, key: &str) -> Result<(), MeshError> {
        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }
        let mut state = self.state.lock();
        state.kv.remove(key);
        state.touch();
        Ok(())
    }
}
