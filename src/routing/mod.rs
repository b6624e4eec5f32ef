/// Key-to-server routing
///
/// Routing is a pure function of the key and the candidate list, so the same key
/// lands on the same server for as long as that server is a candidate.
use crate::core::ServerSpec;
use crate::utils::key_hash;

/// Picks the server responsible for a key
pub trait KeyRouter: Send + Sync {
    fn route<'a>(&self, key: &[u8], servers: &'a [ServerSpec]) -> Option<&'a ServerSpec>;
}

/// Weighted modulo hashing: a server with weight `w` owns `w` buckets
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedHashRouter;

impl KeyRouter for WeightedHashRouter {
    fn route<'a>(&self, key: &[u8], servers: &'a [ServerSpec]) -> Option<&'a ServerSpec> {
        match servers.len() {
            0 => None,
            1 => servers.first(),
            _ => {
                let total: u64 = servers.iter().map(|s| u64::from(s.weight())).sum();
                let mut bucket = u64::from(key_hash(key)) % total;
                for server in servers {
                    let weight = u64::from(server.weight());
                    if bucket < weight {
                        return Some(server);
                    }
                    bucket -= weight;
                }
                servers.last()
            }
        }
    }
}

impl<F> KeyRouter for F
where
    F: for<'a> Fn(&[u8], &'a [ServerSpec]) -> Option<&'a ServerSpec> + Send + Sync,
{
    fn route<'a>(&self, key: &[u8], servers: &'a [ServerSpec]) -> Option<&'a ServerSpec> {
        self(key, servers)
    }
}
