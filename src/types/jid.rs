use std::fmt;
use std::str::FromStr;

/// Known JID servers on WhatsApp.
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";

/// JID represents a WhatsApp user/entity ID (user@server or AD-JID).
///
/// Device JIDs assigned at pairing use the AD form
/// `user.agent:device@server`, e.g. `15551234567.0:0@s.whatsapp.net`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Jid {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub server: String,
    /// Whether this JID uses the AD (`user.agent:device`) form. Kept
    /// explicit so `15551234567.0:0@s.whatsapp.net` round-trips even with
    /// agent and device both zero.
    ad: bool,
}

impl Jid {
    /// New regular JID (user@server).
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            agent: 0,
            device: 0,
            server: server.into(),
            ad: false,
        }
    }

    /// New AD-JID (user.agent:device@server) for device-specific addressing.
    pub fn new_ad(user: impl Into<String>, agent: u8, device: u16) -> Self {
        Self {
            user: user.into(),
            agent,
            device,
            server: DEFAULT_USER_SERVER.to_string(),
            ad: true,
        }
    }

    /// Parse a recipient address for the send surface: either a full JID
    /// (`123@s.whatsapp.net`, `123-456@g.us`) or a bare phone number,
    /// which maps to the default user server.
    pub fn parse_recipient(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if s.contains('@') {
            return s.parse().ok().filter(|j: &Jid| !j.user.is_empty());
        }
        let digits: String = s
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        let acceptable = s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'));
        if !acceptable || digits.len() < 5 {
            return None;
        }
        Some(Self::new(digits, DEFAULT_USER_SERVER))
    }

    /// JID without agent/device (regular user@server).
    pub fn to_non_ad(&self) -> Self {
        Self::new(self.user.clone(), self.server.clone())
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (user_part, server) = s.split_once('@').ok_or(JidParseError)?;
        if server.is_empty() || server.contains('@') {
            return Err(JidParseError);
        }
        let mut jid = Self::new(user_part, server);
        if let Some((user, ad)) = user_part.split_once('.') {
            // user.agent:device@server
            jid.user = user.to_string();
            jid.ad = true;
            let (agent, device) = match ad.split_once(':') {
                Some((a, d)) => (a, Some(d)),
                None => (ad, None),
            };
            jid.agent = agent.parse().map_err(|_| JidParseError)?;
            if let Some(d) = device {
                jid.device = d.parse().map_err(|_| JidParseError)?;
            }
        } else if let Some((user, device)) = user_part.split_once(':') {
            // user:device@server
            jid.user = user.to_string();
            jid.device = device.parse().map_err(|_| JidParseError)?;
        }
        Ok(jid)
    }
}

#[derive(Debug)]
pub struct JidParseError;

impl fmt::Display for JidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid JID format")
    }
}

impl std::error::Error for JidParseError {}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ad {
            write!(
                f,
                "{}.{}:{}@{}",
                self.user, self.agent, self.device, self.server
            )
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl serde::Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Jid::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jid_new_and_display() {
        let j = Jid::new("123456789", DEFAULT_USER_SERVER);
        assert_eq!(j.to_string(), "123456789@s.whatsapp.net");
        assert!(!j.is_group());
    }

    #[test]
    fn jid_parse_roundtrip() {
        let s = "123456789@g.us";
        let j: Jid = s.parse().unwrap();
        assert_eq!(j.user, "123456789");
        assert_eq!(j.server, "g.us");
        assert!(j.is_group());
        assert_eq!(j.to_string(), s);
    }

    #[test]
    fn jid_parse_device_forms() {
        let s = "15551234567.0:0@s.whatsapp.net";
        let j: Jid = s.parse().unwrap();
        assert_eq!(j.user, "15551234567");
        assert_eq!(j.agent, 0);
        assert_eq!(j.device, 0);
        assert_eq!(j.to_string(), s);
        assert_eq!(j, Jid::new_ad("15551234567", 0, 0));

        let j: Jid = "123:2@s.whatsapp.net".parse().unwrap();
        assert_eq!(j.user, "123");
        assert_eq!(j.device, 2);
        assert_eq!(j.to_string(), "123:2@s.whatsapp.net");
    }

    #[test]
    fn jid_ad_display_keeps_device() {
        let j = Jid::new_ad("15551234567", 0, 3);
        let s = j.to_string();
        assert_eq!(s, "15551234567.0:3@s.whatsapp.net");
        let back: Jid = s.parse().unwrap();
        assert_eq!(back, j);
    }

    #[test]
    fn jid_rejects_garbage() {
        assert!("".parse::<Jid>().is_err());
        assert!("no-at-sign".parse::<Jid>().is_err());
        assert!("a@b@c".parse::<Jid>().is_err());
        assert!("1.x:0@s.whatsapp.net".parse::<Jid>().is_err());
    }

    #[test]
    fn recipient_from_phone() {
        let j = Jid::parse_recipient("+55 (11) 99999-9999").unwrap();
        assert_eq!(j.to_string(), "5511999999999@s.whatsapp.net");
        assert!(Jid::parse_recipient("123").is_none());
        assert!(Jid::parse_recipient("not a phone").is_none());
        assert!(Jid::parse_recipient("").is_none());
    }

    #[test]
    fn recipient_from_jid() {
        let j = Jid::parse_recipient("123456789-111@g.us").unwrap();
        assert!(j.is_group());
        assert!(Jid::parse_recipient("@s.whatsapp.net").is_none());
    }

    #[test]
    fn to_non_ad_strips_device() {
        let j = Jid::new_ad("u", 1, 2);
        let n = j.to_non_ad();
        assert_eq!(n.agent, 0);
        assert_eq!(n.device, 0);
        assert_eq!(n.user, "u");
    }
}
