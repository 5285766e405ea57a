use std::fmt::Write as _;

use shared::domain::{ActorId, BoardSnapshot, Coord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Capture(Coord),
    Defend(Coord),
    Reset,
    Board,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "commands: capture <x> <y> | defend <x> <y> | reset | board | status | help | quit";

pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".into());
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "capture" | "c" => Command::Capture(parse_coord(&mut words)?),
        "defend" | "d" => Command::Defend(parse_coord(&mut words)?),
        "reset" => Command::Reset,
        "board" | "b" => Command::Board,
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    match words.next() {
        Some(extra) => Err(format!("unexpected argument '{extra}'")),
        None => Ok(command),
    }
}

fn parse_coord<'a>(words: &mut impl Iterator<Item = &'a str>) -> Result<Coord, String> {
    let mut next = |axis: &str| -> Result<i32, String> {
        let raw = words.next().ok_or_else(|| format!("missing {axis} coordinate"))?;
        raw.parse()
            .map_err(|_| format!("invalid {axis} coordinate '{raw}'"))
    };
    let x = next("x")?;
    let y = next("y")?;
    Ok(Coord::new(x, y))
}

/// One row per board line: `.` free, `@` ours, `#` someone else's, followed by
/// the defense bonus when it is non-zero.
pub fn render_board(board: &BoardSnapshot, me: Option<&ActorId>) -> String {
    let mut out = String::new();
    let mut row = None;
    for cell in board.cells() {
        if row.is_some_and(|y| y != cell.y) {
            out.push('\n');
        } else if row.is_some() {
            out.push(' ');
        }
        row = Some(cell.y);
        let glyph = match &cell.owner_id {
            None => '.',
            Some(owner) if Some(owner) == me => '@',
            Some(_) => '#',
        };
        out.push(glyph);
        if cell.defense_bonus > 0 {
            let _ = write!(out, "{}", cell.defense_bonus);
        } else {
            out.push(' ');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::Cell;

    #[test]
    fn parses_cell_actions() {
        assert_eq!(parse("capture 1 2"), Ok(Command::Capture(Coord::new(1, 2))));
        assert_eq!(parse("  D -1 0 "), Ok(Command::Defend(Coord::new(-1, 0))));
        assert_eq!(parse("reset"), Ok(Command::Reset));
        assert_eq!(parse("q"), Ok(Command::Quit));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("").is_err());
        assert!(parse("capture 1").is_err());
        assert!(parse("capture one 2").is_err());
        assert!(parse("reset now").is_err());
        assert!(parse("fly 1 2").is_err());
    }

    #[test]
    fn renders_rows_with_ownership_glyphs() {
        let me = ActorId::new("me");
        let board = BoardSnapshot::from_cells([
            Cell::new(0, 0).with_owner(Some(me.clone())).with_defense_bonus(2),
            Cell::new(1, 0),
            Cell::new(0, 1).with_owner(Some(ActorId::new("them"))),
            Cell::new(1, 1),
        ]);

        assert_eq!(render_board(&board, Some(&me)), "@2 . \n#  . ");
    }
}
