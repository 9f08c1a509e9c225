//! Point-to-point links between ranks arranged in a line.
//!
//! Rank `r` talks only to `r - 1` (its lower side) and `r + 1` (its upper side). Every
//! message is one particle record encoded with bincode; a record with id
//! [`Particle::END_OF_STEP_ID`] closes the sender's stream for the current step.

use crate::grid::GridError;
use crate::partial_grid::Side;
use crate::particle::Particle;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt;

/// Failures of the distributed exchange.
#[derive(Debug)]
pub enum MigrationError {
    /// A particle moved farther than the neighbouring band in one step.
    BandSkipped { particle: i64, from: usize, to: usize },
    /// The neighbour on the other end of a link has gone away.
    Disconnected { rank: usize, neighbor: usize },
    /// Tried to talk to a neighbour this rank does not have.
    NoNeighbor { rank: usize, side: Side },
    Codec(bincode::Error),
    /// The union of every rank's particles is not exactly the generated id set.
    CountMismatch { expected: usize, found: usize },
    /// A received record names a particle outside the particle array.
    UnknownParticle { id: i64 },
    Grid(GridError),
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::BandSkipped { particle, from, to } => write!(
                f,
                "particle {} moved from rank {} straight to rank {}, skipping a band (time step too large for the band height)",
                particle, from, to
            ),
            MigrationError::Disconnected { rank, neighbor } => {
                write!(f, "rank {} lost its link to rank {}", rank, neighbor)
            }
            MigrationError::NoNeighbor { rank, side } => {
                write!(f, "rank {} has no {:?} neighbour", rank, side)
            }
            MigrationError::Codec(e) => write!(f, "particle record codec error: {}", e),
            MigrationError::CountMismatch { expected, found } => {
                write!(f, "expected {} distinct particles across all ranks, found {}", expected, found)
            }
            MigrationError::UnknownParticle { id } => write!(f, "received a record for unknown particle {}", id),
            MigrationError::Grid(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for MigrationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MigrationError::Codec(e) => Some(&**e),
            MigrationError::Grid(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bincode::Error> for MigrationError {
    fn from(e: bincode::Error) -> Self {
        MigrationError::Codec(e)
    }
}

impl From<GridError> for MigrationError {
    fn from(e: GridError) -> Self {
        MigrationError::Grid(e)
    }
}

pub fn encode(particle: &Particle) -> Result<Vec<u8>, MigrationError> {
    Ok(bincode::serialize(particle)?)
}

pub fn decode(bytes: &[u8]) -> Result<Particle, MigrationError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Both directions of one neighbour connection.
#[derive(Debug)]
struct Link {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// One rank's view of the line.
#[derive(Debug)]
pub struct Communicator {
    rank: usize,
    links: [Option<Link>; 2],
}

impl Communicator {
    /// Builds the communicators of `ranks` ranks connected as `0 - 1 - ... - (ranks - 1)`.
    pub fn line(ranks: usize) -> Vec<Communicator> {
        let mut comms: Vec<Communicator> = (0..ranks)
            .map(|rank| Communicator { rank, links: [None, None] })
            .collect();
        for rank in 1..ranks {
            let (up_tx, up_rx) = unbounded();
            let (down_tx, down_rx) = unbounded();
            comms[rank - 1].links[Side::Upper.slot()] = Some(Link { tx: up_tx, rx: down_rx });
            comms[rank].links[Side::Lower.slot()] = Some(Link { tx: down_tx, rx: up_rx });
        }
        comms
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn has_neighbor(&self, side: Side) -> bool {
        self.links[side.slot()].is_some()
    }

    fn neighbor_rank(&self, side: Side) -> usize {
        match side {
            Side::Lower => self.rank.wrapping_sub(1),
            Side::Upper => self.rank + 1,
        }
    }

    fn link(&self, side: Side) -> Result<&Link, MigrationError> {
        self.links[side.slot()]
            .as_ref()
            .ok_or(MigrationError::NoNeighbor { rank: self.rank, side })
    }

    pub fn send(&self, side: Side, particle: &Particle) -> Result<(), MigrationError> {
        let link = self.link(side)?;
        let bytes = encode(particle)?;
        link.tx.send(bytes).map_err(|_| MigrationError::Disconnected {
            rank: self.rank,
            neighbor: self.neighbor_rank(side),
        })
    }

    pub fn send_end_of_step(&self, side: Side) -> Result<(), MigrationError> {
        self.send(side, &Particle::end_of_step())
    }

    /// Blocks for the next record from `side`. `None` means the neighbour has finished
    /// this step.
    pub fn recv(&self, side: Side) -> Result<Option<Particle>, MigrationError> {
        let link = self.link(side)?;
        let bytes = link.rx.recv().map_err(|_| MigrationError::Disconnected {
            rank: self.rank,
            neighbor: self.neighbor_rank(side),
        })?;
        let particle = decode(&bytes)?;
        Ok((!particle.is_end_of_step()).then_some(particle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_links_only_adjacent_ranks() {
        let comms = Communicator::line(3);
        assert!(!comms[0].has_neighbor(Side::Lower));
        assert!(comms[0].has_neighbor(Side::Upper));
        assert!(comms[1].has_neighbor(Side::Lower) && comms[1].has_neighbor(Side::Upper));
        assert!(!comms[2].has_neighbor(Side::Upper));

        let single = Communicator::line(1);
        assert!(!single[0].has_neighbor(Side::Lower) && !single[0].has_neighbor(Side::Upper));
    }

    #[test]
    fn records_arrive_in_order_then_the_sentinel() {
        let comms = Communicator::line(2);
        let a = Particle::new(4, 0.1, 0.2, 0.3, 0.4);
        let b = Particle::new(9, 0.5, 0.6, 0.7, 0.8);
        comms[0].send(Side::Upper, &a).unwrap();
        comms[0].send(Side::Upper, &b).unwrap();
        comms[0].send_end_of_step(Side::Upper).unwrap();

        assert_eq!(comms[1].recv(Side::Lower).unwrap(), Some(a));
        assert_eq!(comms[1].recv(Side::Lower).unwrap(), Some(b));
        assert_eq!(comms[1].recv(Side::Lower).unwrap(), None);
    }

    #[test]
    fn missing_neighbor_and_hangup_are_errors() {
        let mut comms = Communicator::line(2);
        let p = Particle::new(0, 0.0, 0.0, 0.0, 0.0);
        assert!(matches!(
            comms[0].send(Side::Lower, &p),
            Err(MigrationError::NoNeighbor { rank: 0, side: Side::Lower })
        ));

        comms.truncate(1);
        assert!(matches!(
            comms[0].send(Side::Upper, &p),
            Err(MigrationError::Disconnected { rank: 0, neighbor: 1 })
        ));
        assert!(matches!(
            comms[0].recv(Side::Upper),
            Err(MigrationError::Disconnected { rank: 0, neighbor: 1 })
        ));
    }

    #[test]
    fn wire_record_keeps_every_field() {
        let mut p = Particle::new(12, 0.25, 0.5, -1.0, 2.0);
        p.ax = 3.5;
        let bytes = encode(&p).unwrap();
        assert_eq!(decode(&bytes).unwrap(), p);
        assert!(decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
