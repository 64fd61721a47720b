use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Globally unique board identifier
///
/// Text layout: `host:port:localId`
/// - host: address of the owning peer
/// - port: port the owning peer accepts peer connections on
/// - localId: `board<epoch-millis>` for boards created by this crate
///
/// The host/port part doubles as the routing address used to reach the owner.
/// Ordering is plain string ordering, which is what board lists are sorted by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoardId {
    name: String,
}

impl BoardId {
    pub fn new(host: &str, port: u16, local_id: &str) -> Result<Self, ParseError> {
        format!("{}:{}:{}", host, port, local_id).parse()
    }

    /// Build the id for a board created at `millis` since the epoch
    pub fn from_timestamp(host: &str, port: u16, millis: u128) -> Result<Self, ParseError> {
        Self::new(host, port, &format!("board{}", millis))
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    fn parts(&self) -> (&str, &str, &str) {
        // Validated on construction, so three parts always exist
        let mut it = self.name.rsplitn(3, ':');
        let local = it.next().unwrap_or_default();
        let port = it.next().unwrap_or_default();
        let host = it.next().unwrap_or_default();
        (host, port, local)
    }

    pub fn host(&self) -> &str {
        self.parts().0
    }

    pub fn port(&self) -> u16 {
        self.parts().1.parse().unwrap_or_default()
    }

    pub fn local_id(&self) -> &str {
        self.parts().2
    }

    /// `host:port` of the owning peer
    pub fn owner_addr(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl FromStr for BoardId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('%') || s.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidBoardId(s.to_string()));
        }

        let parts: Vec<&str> = s.rsplitn(3, ':').collect();
        if parts.len() != 3 {
            return Err(ParseError::InvalidBoardId(s.to_string()));
        }
        let (local, port, host) = (parts[0], parts[1], parts[2]);
        if local.is_empty() || host.is_empty() {
            return Err(ParseError::InvalidBoardId(s.to_string()));
        }
        port.parse::<u16>()
            .map_err(|_| ParseError::InvalidBoardId(s.to_string()))?;

        Ok(Self {
            name: s.to_string(),
        })
    }
}

/// Errors produced while parsing ids and path tokens
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid board id: {0:?}")]
    InvalidBoardId(String),
    #[error("invalid colour: {0:?}")]
    InvalidColor(String),
    #[error("invalid point: {0:?}")]
    InvalidPoint(String),
    #[error("path has no points")]
    EmptyPath,
}

/// Stroke colour of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Black,
    Red,
    Rgb(u8, u8, u8),
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Black => f.write_str("black"),
            Color::Red => f.write_str("red"),
            Color::Rgb(r, g, b) => write!(f, "#{:02x}{:02x}{:02x}", r, g, b),
        }
    }
}

impl FromStr for Color {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "black" => Ok(Color::Black),
            "red" => Ok(Color::Red),
            hex if hex.len() == 7 && hex.starts_with('#') => {
                // Byte ranges; a multi-byte char makes `get` return None
                let channel = |range: std::ops::Range<usize>| {
                    hex.get(range)
                        .filter(|digits| digits.bytes().all(|b| b.is_ascii_hexdigit()))
                        .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                        .ok_or_else(|| ParseError::InvalidColor(s.to_string()))
                };
                Ok(Color::Rgb(channel(1..3)?, channel(3..5)?, channel(5..7)?))
            }
            _ => Err(ParseError::InvalidColor(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl FromStr for Point {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, y) = s
            .split_once(',')
            .ok_or_else(|| ParseError::InvalidPoint(s.to_string()))?;
        let x = x
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidPoint(s.to_string()))?;
        let y = y
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidPoint(s.to_string()))?;
        Ok(Self { x, y })
    }
}

/// One continuous stroke
///
/// Token format: `colour;x,y;x,y;...` with at least one point. The token
/// never contains `%`, so it can sit inside a board payload as one field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    color: Color,
    points: Vec<Point>,
}

impl Path {
    pub fn new(color: Color, points: Vec<Point>) -> Result<Self, ParseError> {
        if points.is_empty() {
            return Err(ParseError::EmptyPath);
        }
        Ok(Self { color, points })
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.color)?;
        for point in &self.points {
            write!(f, ";{}", point)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(';');
        let color = fields.next().unwrap_or_default().parse()?;
        let points = fields
            .map(Point::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(color, points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // BoardId tests
    #[test]
    fn test_board_id_parts() {
        let id: BoardId = "127.0.0.1:4000:board1700000000000".parse().unwrap();
        assert_eq!(id.host(), "127.0.0.1");
        assert_eq!(id.port(), 4000);
        assert_eq!(id.local_id(), "board1700000000000");
        assert_eq!(id.owner_addr(), "127.0.0.1:4000");
    }

    #[test]
    fn test_board_id_from_timestamp() {
        let id = BoardId::from_timestamp("localhost", 9000, 42).unwrap();
        assert_eq!(id.as_str(), "localhost:9000:board42");
        assert_eq!(id.to_string(), "localhost:9000:board42");
    }

    #[test]
    fn test_board_id_invalid() {
        assert!("nohostport".parse::<BoardId>().is_err());
        assert!("host:board1".parse::<BoardId>().is_err());
        assert!("host:notaport:board1".parse::<BoardId>().is_err());
        assert!("host:70000:board1".parse::<BoardId>().is_err());
        assert!(":4000:board1".parse::<BoardId>().is_err());
        assert!("host:4000:".parse::<BoardId>().is_err());
        assert!("host:4000:bo%ard".parse::<BoardId>().is_err());
    }

    #[test]
    fn test_board_id_ordering_is_textual() {
        let a: BoardId = "a:1:board2".parse().unwrap();
        let b: BoardId = "a:1:board10".parse().unwrap();
        // "board10" < "board2" as strings
        assert!(b < a);
    }

    // Path tests
    #[test]
    fn test_color_parse() {
        assert_eq!("black".parse::<Color>().unwrap(), Color::Black);
        assert_eq!("red".parse::<Color>().unwrap(), Color::Red);
        assert_eq!("#0a10ff".parse::<Color>().unwrap(), Color::Rgb(10, 16, 255));
        assert_eq!(Color::Rgb(10, 16, 255).to_string(), "#0a10ff");
        assert!("blue".parse::<Color>().is_err());
        assert!("#12345".parse::<Color>().is_err());
        assert!("#zz0000".parse::<Color>().is_err());
    }

    #[test]
    fn test_color_non_ascii_is_rejected() {
        // Seven bytes, but the channel boundaries fall inside characters
        assert_eq!(
            "#aééb".parse::<Color>(),
            Err(ParseError::InvalidColor("#aééb".to_string()))
        );
        assert!("#€0000".parse::<Color>().is_err());
        assert!("#+1+2+3".parse::<Color>().is_err());
        assert!("#aééb;1,1".parse::<Path>().is_err());
    }

    #[test]
    fn test_path_token() {
        let path = Path::new(Color::Red, vec![Point::new(1, 2), Point::new(-3, 4)]).unwrap();
        assert_eq!(path.to_string(), "red;1,2;-3,4");

        let parsed: Path = "red;1,2;-3,4".parse().unwrap();
        assert_eq!(parsed, path);
    }

    #[test]
    fn test_path_requires_points() {
        assert_eq!(Path::new(Color::Black, vec![]), Err(ParseError::EmptyPath));
        assert_eq!("black".parse::<Path>(), Err(ParseError::EmptyPath));
    }

    #[test]
    fn test_path_invalid_tokens() {
        assert!("".parse::<Path>().is_err());
        assert!("black;1".parse::<Path>().is_err());
        assert!("black;a,b".parse::<Path>().is_err());
        assert!("green;1,1".parse::<Path>().is_err());
    }
}
