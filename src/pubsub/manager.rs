use crate::client::Session;
use crate::error::Result;
use crate::network::Backend;
use crate::protocol::{quote_ident, validate_channel};
use tracing::debug;

/// Validate every name before anything goes on the wire
pub(crate) fn validated<I, S>(names: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| {
            let name = name.as_ref();
            validate_channel(name)?;
            Ok(name.to_string())
        })
        .collect()
}

impl<B: Backend> Session<B> {
    /// LISTEN on every name not yet subscribed.
    ///
    /// Stops at the first failure; names that succeeded before it stay
    /// subscribed.
    pub(crate) fn listen(&mut self, channels: Vec<String>) -> Result<usize> {
        let mut added = 0;

        for channel in channels {
            if self.channels.contains(&channel) {
                continue;
            }

            self.backend
                .execute(&format!("LISTEN {}", quote_ident(&channel)))?;
            debug!("Listening on {:?}", channel);
            self.channels.insert(channel);
            added += 1;
        }

        Ok(added)
    }

    /// UNLISTEN every name that is subscribed, ignoring the rest
    pub(crate) fn unlisten(&mut self, channels: Vec<String>) -> Result<usize> {
        let mut removed = 0;

        for channel in channels {
            if !self.channels.contains(&channel) {
                continue;
            }

            self.backend
                .execute(&format!("UNLISTEN {}", quote_ident(&channel)))?;
            debug!("Stopped listening on {:?}", channel);
            self.channels.remove(&channel);
            removed += 1;
        }

        Ok(removed)
    }

    /// One `UNLISTEN *`, skipped when nothing is subscribed
    pub(crate) fn unlisten_all(&mut self) -> Result<usize> {
        if self.channels.is_empty() {
            return Ok(0);
        }

        self.backend.execute("UNLISTEN *")?;
        let removed = self.channels.len();
        self.channels.clear();
        debug!("Stopped listening on all {} channels", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::ScriptedBackend;
    use crate::error::Error;
    use std::collections::HashSet;

    fn session() -> Session<ScriptedBackend> {
        Session {
            backend: ScriptedBackend::default(),
            channels: HashSet::new(),
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        validated(list).unwrap()
    }

    #[test]
    fn test_listen_skips_known_and_duplicate_names() {
        let mut s = session();
        assert_eq!(s.listen(names(&["a", "b", "a"])).unwrap(), 2);
        assert_eq!(s.listen(names(&["b", "c"])).unwrap(), 1);

        assert_eq!(
            s.backend.commands,
            vec!["LISTEN \"a\"", "LISTEN \"b\"", "LISTEN \"c\""]
        );
        assert_eq!(s.channels.len(), 3);
    }

    #[test]
    fn test_listen_quotes_names() {
        let mut s = session();
        s.listen(names(&["Mixed \"Case\""])).unwrap();
        assert_eq!(s.backend.commands, vec!["LISTEN \"Mixed \"\"Case\"\"\""]);
    }

    #[test]
    fn test_listen_partial_failure() {
        let mut s = session();
        s.backend.results.push_back(Ok(Default::default()));
        s.backend.results.push_back(Err(Error::ConnectionClosed));

        assert!(s.listen(names(&["a", "b", "c"])).is_err());
        assert!(s.channels.contains("a"));
        assert!(!s.channels.contains("b"));
        assert!(!s.channels.contains("c"));
        assert_eq!(s.backend.commands.len(), 2);
    }

    #[test]
    fn test_unlisten_ignores_unknown() {
        let mut s = session();
        s.listen(names(&["a", "b"])).unwrap();
        s.backend.commands.clear();

        assert_eq!(s.unlisten(names(&["a", "zzz"])).unwrap(), 1);
        assert_eq!(s.backend.commands, vec!["UNLISTEN \"a\""]);
        assert_eq!(s.channels, HashSet::from(["b".to_string()]));
    }

    #[test]
    fn test_unlisten_all() {
        let mut s = session();
        assert_eq!(s.unlisten_all().unwrap(), 0);
        assert!(s.backend.commands.is_empty());

        s.listen(names(&["a", "b"])).unwrap();
        assert_eq!(s.unlisten_all().unwrap(), 2);
        assert_eq!(s.backend.commands.last().unwrap(), "UNLISTEN *");
        assert!(s.channels.is_empty());
    }

    #[test]
    fn test_validated_rejects_any_bad_name() {
        assert!(matches!(
            validated(["ok", ""]),
            Err(Error::InvalidChannelName { .. })
        ));
        assert!(validated(["x".repeat(64)]).is_err());
    }
}
