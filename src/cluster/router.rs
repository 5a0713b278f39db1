use std::collections::HashMap;

/// How the cluster front end handles a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Run on this node without routing.
    Local,
    /// Forward to the owner of the first key.
    Relay,
    /// Multi-key delete, two-phase when the keys span nodes.
    Del,
    /// Multi-key set, two-phase when the keys span nodes.
    MSet,
    /// Scatter-gather read.
    MGet,
    /// Scatter to owners and sum the counts.
    Exists,
    /// Set-if-none-exist; the keys must share an owner.
    MSetNx,
    /// Allowed only when both keys have the same owner.
    Rename,
    /// Run on every node.
    Broadcast,
    Prepare,
    Commit,
    Rollback,
}

/// Built once; commands not listed here are relayed by their first key.
pub fn route_table() -> HashMap<&'static str, Route> {
    let mut routes = HashMap::new();
    for name in ["ping", "echo", "keys", "dbsize", "randomkey", "bgrewriteaof"] {
        routes.insert(name, Route::Local);
    }
    routes.insert("del", Route::Del);
    routes.insert("mset", Route::MSet);
    routes.insert("mget", Route::MGet);
    routes.insert("exists", Route::Exists);
    routes.insert("msetnx", Route::MSetNx);
    routes.insert("rename", Route::Rename);
    routes.insert("renamenx", Route::Rename);
    routes.insert("flushdb", Route::Broadcast);
    routes.insert("flushall", Route::Broadcast);
    routes.insert("prepare", Route::Prepare);
    routes.insert("commit", Route::Commit);
    routes.insert("rollback", Route::Rollback);
    routes
}

pub fn route_of(routes: &HashMap<&'static str, Route>, name: &str) -> Route {
    routes.get(name).copied().unwrap_or(Route::Relay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        let routes = route_table();
        assert_eq!(route_of(&routes, "del"), Route::Del);
        assert_eq!(route_of(&routes, "ping"), Route::Local);
        assert_eq!(route_of(&routes, "get"), Route::Relay);
        assert_eq!(route_of(&routes, "hset"), Route::Relay);
        assert_eq!(route_of(&routes, "commit"), Route::Commit);
        assert_eq!(route_of(&routes, "exists"), Route::Exists);
        assert_eq!(route_of(&routes, "msetnx"), Route::MSetNx);
    }
}
