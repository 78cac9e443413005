//! Replay records returned by the statistics API.
//!
//! The API encodes a few fields in its own way: races are single letters,
//! the winner flag is a `0`/`1` integer and colours are `"r,g,b"` strings.
//! Those are decoded here into proper types.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};

/// The most recent replay of an account.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Replay {
    /// Identifier used as the change-detection marker.
    pub replay_id: i64,
    /// Public page of the replay.
    pub replay_url: String,
    pub map_name: String,
    /// Team format, e.g. "1v1".
    pub format: String,
    /// Ladder, custom, ...
    pub game_type: String,
    #[serde(default)]
    pub winning_player: String,
    #[serde(default)]
    pub players: Vec<Player>,
    #[serde(rename = "seasons_id", default)]
    pub season_id: i64,
    #[serde(deserialize_with = "deserialize_replay_date")]
    pub replay_date: DateTime<Utc>,
    #[serde(default)]
    pub replay_version: String,
}

impl Replay {
    /// Returns the first player flagged as winner.
    pub fn winner(&self) -> Option<&Player> {
        self.players.iter().find(|p| p.winner)
    }
}

/// One participant of a replay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Player {
    #[serde(rename = "players_id")]
    pub id: i64,
    #[serde(default)]
    pub clan: String,
    pub race: Race,
    #[serde(default)]
    pub mmr: i64,
    #[serde(default)]
    pub division: String,
    #[serde(default)]
    pub server_rank: i64,
    #[serde(default)]
    pub global_rank: i64,
    #[serde(default)]
    pub apm: i64,
    #[serde(default)]
    pub team: i64,
    #[serde(deserialize_with = "deserialize_winner")]
    pub winner: bool,
    pub color: PlayerColor,
}

/// Playable race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Race {
    Protoss,
    Terran,
    Zerg,
    Unknown,
}

impl Race {
    /// Decodes the API's one-letter code. Anything unrecognised is `Unknown`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "P" => Race::Protoss,
            "T" => Race::Terran,
            "Z" => Race::Zerg,
            _ => Race::Unknown,
        }
    }
}

impl fmt::Display for Race {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Race::Protoss => "Protoss",
            Race::Terran => "Terran",
            Race::Zerg => "Zerg",
            Race::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for Race {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(Race::from_code(&code))
    }
}

/// Opaque RGB player colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PlayerColor {
    /// Parses `"r,g,b"` with each component in `0..=255`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let components: Vec<&str> = value.split(',').collect();
        let [r, g, b] = components.as_slice() else {
            return Err(format!("invalid color string: {}", value));
        };

        let channel = |component: &str, name: &str| {
            component
                .trim()
                .parse::<u8>()
                .map_err(|_| format!("invalid color string ({}): {}", name, value))
        };

        Ok(Self {
            r: channel(*r, "R")?,
            g: channel(*g, "G")?,
            b: channel(*b, "B")?,
        })
    }

    /// Packs the colour into the `0xRRGGBB` integer chat embeds use.
    pub fn to_rgb_int(self) -> u32 {
        (u32::from(self.r) << 16) | (u32::from(self.g) << 8) | u32::from(self.b)
    }
}

impl<'de> Deserialize<'de> for PlayerColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        PlayerColor::parse(&value).map_err(serde::de::Error::custom)
    }
}

fn deserialize_winner<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match i64::deserialize(deserializer)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(serde::de::Error::custom(format!("invalid winner: {}", other))),
    }
}

/// Accepts RFC 3339 and the bare `YYYY-MM-DD HH:MM:SS` form (taken as UTC).
fn deserialize_replay_date<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error> {
    let value = String::deserialize(deserializer)?;
    if let Ok(date) = DateTime::parse_from_rfc3339(&value) {
        return Ok(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| serde::de::Error::custom(format!("invalid replay date: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_json(race: &str, winner: serde_json::Value, color: &str) -> serde_json::Value {
        serde_json::json!({
            "players_id": 11,
            "clan": "ABC",
            "race": race,
            "mmr": 4200,
            "division": "Diamond",
            "server_rank": 10,
            "global_rank": 250,
            "apm": 180,
            "team": 1,
            "winner": winner,
            "color": color
        })
    }

    #[test]
    fn test_decode_replay() {
        let json = serde_json::json!({
            "replay_url": "https://sc2replaystats.com/replay/43",
            "replay_id": 43,
            "map_name": "Ever Dream LE",
            "format": "1v1",
            "game_type": "Ladder",
            "winning_player": "Alice",
            "players": [
                player_json("P", serde_json::json!(1), "180,20,30"),
                player_json("Z", serde_json::json!(0), "0,66,255")
            ],
            "seasons_id": 42,
            "replay_date": "2024-03-01T12:00:00Z",
            "replay_version": "5.0.12"
        });

        let replay: Replay = serde_json::from_value(json).unwrap();
        assert_eq!(replay.replay_id, 43);
        assert_eq!(replay.season_id, 42);
        assert_eq!(replay.players[0].race, Race::Protoss);
        assert_eq!(replay.players[1].race, Race::Zerg);
        assert_eq!(replay.winner().map(|p| p.color.r), Some(180));
    }

    #[test]
    fn test_unknown_race_code() {
        assert_eq!(Race::from_code("R"), Race::Unknown);
        assert_eq!(Race::from_code(""), Race::Unknown);
        assert_eq!(Race::Terran.to_string(), "Terran");
    }

    #[test]
    fn test_winner_must_be_zero_or_one() {
        let err = serde_json::from_value::<Player>(player_json("T", serde_json::json!(2), "1,2,3"))
            .unwrap_err();
        assert!(err.to_string().contains("invalid winner"));

        assert!(
            serde_json::from_value::<Player>(player_json("T", serde_json::json!(true), "1,2,3"))
                .is_err()
        );
    }

    #[test]
    fn test_color_parsing() {
        let color = PlayerColor::parse("255,128,0").unwrap();
        assert_eq!(color.to_rgb_int(), 0xFF8000);

        assert!(PlayerColor::parse("1,2").is_err());
        assert!(PlayerColor::parse("1,2,3,4").is_err());
        assert!(PlayerColor::parse("256,0,0").unwrap_err().contains("(R)"));
        assert!(PlayerColor::parse("0,x,0").unwrap_err().contains("(G)"));
    }

    #[test]
    fn test_replay_date_formats() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "deserialize_replay_date")]
            at: DateTime<Utc>,
        }

        let a: Wrapper = serde_json::from_str(r#"{"at": "2024-03-01T13:00:00+01:00"}"#).unwrap();
        let b: Wrapper = serde_json::from_str(r#"{"at": "2024-03-01 12:00:00"}"#).unwrap();
        assert_eq!(a.at, b.at);
        assert!(serde_json::from_str::<Wrapper>(r#"{"at": "yesterday"}"#).is_err());
    }
}
