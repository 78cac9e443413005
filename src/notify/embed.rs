//! Chat embed built for a new replay.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::replays::{Player, Replay};

/// Embed colour when no winner is known.
const NEUTRAL_COLOR: u32 = 0x95A5A6;

/// A rich message as accepted by the chat API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub description: String,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
}

/// A named value shown inside an embed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Small text at the bottom of an embed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Formats `replay` for delivery to a subscribed channel.
///
/// One inline field per player; the embed takes the winner's colour.
pub fn replay_embed(replay: &Replay) -> Embed {
    let winner = if replay.winning_player.is_empty() {
        "unknown".to_string()
    } else {
        replay.winning_player.clone()
    };

    let color = replay
        .winner()
        .map(|p| p.color.to_rgb_int())
        .unwrap_or(NEUTRAL_COLOR);

    let url = (!replay.replay_url.is_empty()).then(|| replay.replay_url.clone());

    let footer = (!replay.replay_version.is_empty()).then(|| EmbedFooter {
        text: format!("Game version {}", replay.replay_version),
    });

    Embed {
        title: replay.map_name.clone(),
        url,
        description: format!(
            "{} {} game, won by **{}**",
            replay.format, replay.game_type, winner
        ),
        color,
        timestamp: Some(replay.replay_date),
        fields: replay.players.iter().map(player_field).collect(),
        footer,
    }
}

fn player_field(player: &Player) -> EmbedField {
    let name = if player.clan.is_empty() {
        format!("Player {} (team {})", player.id, player.team)
    } else {
        format!("[{}] Player {} (team {})", player.clan, player.id, player.team)
    };

    let mut value = format!("{}\nMMR {}\nAPM {}", player.race, player.mmr, player.apm);
    if !player.division.is_empty() {
        value.push_str(&format!("\n{}", player.division));
    }
    if player.winner {
        value.push_str("\nWinner");
    }

    EmbedField {
        name,
        value,
        inline: true,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::replays::{PlayerColor, Race};

    fn player(id: i64, race: Race, winner: bool, color: PlayerColor) -> Player {
        Player {
            id,
            clan: String::new(),
            race,
            mmr: 4000 + id,
            division: String::new(),
            server_rank: 0,
            global_rank: 0,
            apm: 150,
            team: id,
            winner,
            color,
        }
    }

    fn replay(players: Vec<Player>) -> Replay {
        Replay {
            replay_id: 43,
            replay_url: "https://sc2replaystats.com/replay/43".to_string(),
            map_name: "Ever Dream LE".to_string(),
            format: "1v1".to_string(),
            game_type: "Ladder".to_string(),
            winning_player: "Alice".to_string(),
            players,
            season_id: 42,
            replay_date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            replay_version: "5.0.12".to_string(),
        }
    }

    #[test]
    fn test_embed_uses_winner_color_and_lists_players() {
        let red = PlayerColor { r: 255, g: 0, b: 0 };
        let blue = PlayerColor { r: 0, g: 0, b: 255 };
        let embed = replay_embed(&replay(vec![
            player(1, Race::Protoss, false, blue),
            player(2, Race::Zerg, true, red),
        ]));

        assert_eq!(embed.title, "Ever Dream LE");
        assert_eq!(embed.color, 0xFF0000);
        assert_eq!(embed.fields.len(), 2);
        assert!(embed.fields[0].value.starts_with("Protoss"));
        assert!(embed.fields[1].value.contains("Winner"));
        assert!(embed.description.contains("Alice"));
    }

    #[test]
    fn test_embed_without_players() {
        let embed = replay_embed(&replay(Vec::new()));
        assert_eq!(embed.color, NEUTRAL_COLOR);
        assert!(embed.fields.is_empty());
    }

    #[test]
    fn test_embed_serializes_for_chat_api() {
        let mut r = replay(Vec::new());
        r.replay_url.clear();
        let json = serde_json::to_value(replay_embed(&r)).unwrap();

        assert!(json.get("url").is_none());
        assert_eq!(json["timestamp"], "2024-03-01T12:00:00Z");
        assert_eq!(json["footer"]["text"], "Game version 5.0.12");
    }
}
