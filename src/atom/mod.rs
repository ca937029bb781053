//! Element data used for connectivity inference and force-field defaults

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when reading element symbols
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ElementError {
    #[error("Unknown element symbol: {0:?}")]
    UnknownSymbol(String),
}

/// Chemical elements supported by the built-in tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Element {
    Hydrogen,
    Helium,
    Lithium,
    Beryllium,
    Boron,
    Carbon,
    Nitrogen,
    Oxygen,
    Fluorine,
    Neon,
    Sodium,
    Magnesium,
    Aluminium,
    Silicon,
    Phosphorus,
    Sulfur,
    Chlorine,
    Argon,
    Potassium,
    Calcium,
    Iron,
    Zinc,
    Bromine,
    Iodine,
}

impl Element {
    /// Returns the covalent radius of the element in Angstroms
    /// (Cordero et al., Dalton Trans. 2008)
    pub fn covalent_radius(&self) -> f64 {
        match self {
            Element::Hydrogen => 0.31,
            Element::Helium => 0.28,
            Element::Lithium => 1.28,
            Element::Beryllium => 0.96,
            Element::Boron => 0.84,
            Element::Carbon => 0.76,
            Element::Nitrogen => 0.71,
            Element::Oxygen => 0.66,
            Element::Fluorine => 0.57,
            Element::Neon => 0.58,
            Element::Sodium => 1.66,
            Element::Magnesium => 1.41,
            Element::Aluminium => 1.21,
            Element::Silicon => 1.11,
            Element::Phosphorus => 1.07,
            Element::Sulfur => 1.05,
            Element::Chlorine => 1.02,
            Element::Argon => 1.06,
            Element::Potassium => 2.03,
            Element::Calcium => 1.76,
            Element::Iron => 1.32,
            Element::Zinc => 1.22,
            Element::Bromine => 1.20,
            Element::Iodine => 1.39,
        }
    }

    /// Atomic number
    pub fn atomic_number(&self) -> u8 {
        match self {
            Element::Hydrogen => 1,
            Element::Helium => 2,
            Element::Lithium => 3,
            Element::Beryllium => 4,
            Element::Boron => 5,
            Element::Carbon => 6,
            Element::Nitrogen => 7,
            Element::Oxygen => 8,
            Element::Fluorine => 9,
            Element::Neon => 10,
            Element::Sodium => 11,
            Element::Magnesium => 12,
            Element::Aluminium => 13,
            Element::Silicon => 14,
            Element::Phosphorus => 15,
            Element::Sulfur => 16,
            Element::Chlorine => 17,
            Element::Argon => 18,
            Element::Potassium => 19,
            Element::Calcium => 20,
            Element::Iron => 26,
            Element::Zinc => 30,
            Element::Bromine => 35,
            Element::Iodine => 53,
        }
    }

    /// Parse an element from its symbol (case-insensitive)
    pub fn from_symbol(s: &str) -> Result<Self, ElementError> {
        let element = match s.trim().to_uppercase().as_str() {
            "H" | "D" => Element::Hydrogen,
            "HE" => Element::Helium,
            "LI" => Element::Lithium,
            "BE" => Element::Beryllium,
            "B" => Element::Boron,
            "C" => Element::Carbon,
            "N" => Element::Nitrogen,
            "O" => Element::Oxygen,
            "F" => Element::Fluorine,
            "NE" => Element::Neon,
            "NA" => Element::Sodium,
            "MG" => Element::Magnesium,
            "AL" => Element::Aluminium,
            "SI" => Element::Silicon,
            "P" => Element::Phosphorus,
            "S" => Element::Sulfur,
            "CL" => Element::Chlorine,
            "AR" => Element::Argon,
            "K" => Element::Potassium,
            "CA" => Element::Calcium,
            "FE" => Element::Iron,
            "ZN" => Element::Zinc,
            "BR" => Element::Bromine,
            "I" => Element::Iodine,
            _ => return Err(ElementError::UnknownSymbol(s.to_string())),
        };
        Ok(element)
    }

    /// Canonical element symbol
    pub fn symbol(&self) -> &'static str {
        match self {
            Element::Hydrogen => "H",
            Element::Helium => "He",
            Element::Lithium => "Li",
            Element::Beryllium => "Be",
            Element::Boron => "B",
            Element::Carbon => "C",
            Element::Nitrogen => "N",
            Element::Oxygen => "O",
            Element::Fluorine => "F",
            Element::Neon => "Ne",
            Element::Sodium => "Na",
            Element::Magnesium => "Mg",
            Element::Aluminium => "Al",
            Element::Silicon => "Si",
            Element::Phosphorus => "P",
            Element::Sulfur => "S",
            Element::Chlorine => "Cl",
            Element::Argon => "Ar",
            Element::Potassium => "K",
            Element::Calcium => "Ca",
            Element::Iron => "Fe",
            Element::Zinc => "Zn",
            Element::Bromine => "Br",
            Element::Iodine => "I",
        }
    }
}

impl FromStr for Element {
    type Err = ElementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Element::from_symbol(s)
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covalent_radius() {
        assert_eq!(Element::Hydrogen.covalent_radius(), 0.31);
        assert_eq!(Element::Carbon.covalent_radius(), 0.76);
        assert_eq!(Element::Oxygen.covalent_radius(), 0.66);
    }

    #[test]
    fn test_from_symbol() {
        assert_eq!(Element::from_symbol("H"), Ok(Element::Hydrogen));
        assert_eq!(Element::from_symbol("cl"), Ok(Element::Chlorine));
        assert_eq!(Element::from_symbol(" O "), Ok(Element::Oxygen));
        assert_eq!("Br".parse::<Element>(), Ok(Element::Bromine));
        assert!(Element::from_symbol("Xx").is_err());
    }

    #[test]
    fn test_symbol_round_trip() {
        for symbol in ["H", "C", "N", "O", "Cl", "Zn", "I"] {
            let element = Element::from_symbol(symbol).unwrap();
            assert_eq!(element.symbol(), symbol);
            assert_eq!(format!("{}", element), symbol);
        }
    }

    #[test]
    fn test_atomic_number() {
        assert_eq!(Element::Hydrogen.atomic_number(), 1);
        assert_eq!(Element::Oxygen.atomic_number(), 8);
        assert_eq!(Element::Iodine.atomic_number(), 53);
    }
}
